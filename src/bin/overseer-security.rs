//! Security management CLI for Overseer
//!
//! Provides a command-line interface for inspecting the security posture, dry-running
//! policy checks, reading the audit trail, managing users and reversing operations.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info};

use overseer::security::{
    AuditEventType, OperationContext, PermissionLevel, SecurityConfig, SecurityLevel,
    SecurityManager, SecurityPaths, ValidationResult,
};
use overseer::utils::overseer_home;

#[derive(Parser)]
#[command(name = "overseer-security")]
#[command(about = "Security management CLI for Overseer")]
#[command(version)]
struct Cli {
    /// Directory holding the security state (defaults to $OVERSEER_HOME or ~/.overseer)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show security status and configuration
    Status,
    /// Summarize audit activity
    Summary {
        /// Hours to look back
        #[arg(long, default_value = "24")]
        hours: u64,
    },
    /// Dry-run a command against the policy
    Check {
        /// Command line to check
        command: String,
    },
    /// Dry-run a file path against the policy
    CheckFile {
        path: String,
    },
    /// Dry-run a URL against the network policy
    CheckUrl {
        url: String,
    },
    /// Read and maintain the audit log
    Audit {
        #[command(subcommand)]
        action: AuditCommands,
    },
    /// List and reverse recorded operations
    Undo {
        #[command(subcommand)]
        action: UndoCommands,
    },
    /// Manage users and permission levels
    Users {
        #[command(subcommand)]
        action: UserCommands,
    },
    /// Write a default security configuration
    Init {
        /// Security level (low, medium, high, critical)
        #[arg(short, long, default_value = "medium")]
        level: String,
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Show recent audit entries
    Recent {
        /// Hours to look back
        #[arg(long, default_value = "24")]
        hours: u64,
        /// Event type filter
        #[arg(short = 't', long = "type")]
        event_type: Option<String>,
        /// User ID filter
        #[arg(short, long)]
        user: Option<String>,
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        count: usize,
    },
    /// Drop entries older than the retention period
    Cleanup,
    /// Write entries to a JSON file
    Export {
        output: PathBuf,
        /// Only export the last N hours
        #[arg(long)]
        hours: Option<u64>,
    },
}

#[derive(Subcommand)]
enum UndoCommands {
    /// List outstanding operations
    List {
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Reverse one operation
    Run {
        operation_id: String,
        /// Open the session as this user instead of the OS user
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Reverse the newest outstanding operation of the session user
    Last {
        /// Open the session as this user instead of the OS user
        #[arg(short, long)]
        user: Option<String>,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// List all users
    List,
    /// Add a user
    Add {
        user: String,
        /// Permission level (read_only, limited, standard, admin)
        #[arg(short, long, default_value = "standard")]
        level: String,
    },
    /// Change a user's permission level
    SetLevel {
        user: String,
        level: String,
    },
    /// Deactivate a user and end their sessions
    Deactivate {
        user: String,
    },
    /// Delete a user
    Delete {
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let home = cli.home.clone().unwrap_or_else(overseer_home);
    let paths = SecurityPaths::in_dir(&home);
    debug!("Using security state in {:?}", home);

    if let Commands::Init { level, force } = &cli.command {
        return init_security_config(&paths, level, *force);
    }

    let manager = SecurityManager::new(paths).context("Failed to initialize security manager")?;

    match cli.command {
        Commands::Status => show_status(&manager, cli.json),
        Commands::Summary { hours } => show_summary(&manager, hours, cli.json),
        Commands::Check { command } => {
            print_check(&command, manager.validator().validate_command(&command), cli.json)
        }
        Commands::CheckFile { path } => {
            print_check(&path, manager.validator().validate_file_path(&path), cli.json)
        }
        Commands::CheckUrl { url } => {
            print_check(&url, manager.validator().validate_url(&url), cli.json)
        }
        Commands::Audit { action } => handle_audit(&manager, action, cli.json),
        Commands::Undo { action } => handle_undo(&manager, action, cli.json),
        Commands::Users { action } => handle_users(&manager, action, cli.json),
        Commands::Init { .. } => Ok(()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn show_status(manager: &SecurityManager, json: bool) -> Result<()> {
    let status = manager.get_security_status();
    if json {
        return print_json(&status);
    }

    println!("🔒 Overseer Security Status");
    println!("===========================");
    println!("Security Level: {}", status.security_level);
    println!("Default Permission Level: {}", status.default_permission_level);
    println!("Sandbox Mode: {}", status.sandbox_mode);
    println!("Users: {}", status.users);
    println!("Active Sessions: {}", status.active_sessions);
    println!("Undoable Operations: {}", status.undoable_operations);
    println!(
        "Audit Logging: {} ({})",
        if status.audit_enabled { "✅ ENABLED" } else { "❌ DISABLED" },
        status.audit_log.display()
    );
    println!(
        "Encryption: {} ({})",
        if status.encryption.enabled { "✅ ENABLED" } else { "❌ DISABLED" },
        status.encryption.algorithm
    );
    if status.encryption.rotation_due {
        println!("  - ⚠️  Key rotation is due");
    }
    println!("Threat Detection: {}", status.threat_detection.service_status);
    println!("  - Active Rules: {}", status.threat_detection.active_rules_count);
    println!("  - Blocked Sources: {}", status.blocked_sources.len());
    for blocked in &status.blocked_sources {
        println!("    • {} since {} ({})", blocked.source, blocked.blocked_at, blocked.reason);
    }
    Ok(())
}

fn show_summary(manager: &SecurityManager, hours: u64, json: bool) -> Result<()> {
    let summary = manager.get_security_summary(hours)?;
    if json {
        return print_json(&summary);
    }

    println!("📊 Security Summary (last {} hours)", hours);
    println!("=================================");
    println!("Total Events: {}", summary.audit.total_events);
    println!("Failed Operations: {}", summary.audit.failed_operations);
    println!("Security Violations: {}", summary.audit.security_violations);
    println!("Threats Detected: {}", summary.audit.threats_detected);
    println!("High Risk Events: {}", summary.audit.high_risk_events);
    println!("Unique Users: {}", summary.audit.unique_users.len());
    if !summary.audit.events_by_type.is_empty() {
        println!("Events by Type:");
        for (event_type, count) in &summary.audit.events_by_type {
            println!("  - {}: {}", event_type, count);
        }
    }
    Ok(())
}

fn print_check(subject: &str, result: ValidationResult, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "subject": subject,
            "allowed": result.is_valid,
            "message": result.message,
            "risk_level": result.assessment.risk_level,
            "warnings": result.assessment.warnings,
            "requires_confirmation": result.assessment.requires_confirmation,
            "requires_admin": result.assessment.requires_admin,
        }));
    }

    if result.is_valid {
        println!("✅ ALLOWED: {}", subject);
    } else {
        println!("❌ BLOCKED: {}", subject);
    }
    println!("Risk Level: {}", result.assessment.risk_level);
    if let Some(message) = &result.message {
        println!("Reason: {}", message);
    }
    if result.assessment.requires_confirmation {
        println!("⚠️  Requires confirmation");
    }
    if result.assessment.requires_admin {
        println!("⚠️  Requires admin rights");
    }
    for warning in &result.assessment.warnings {
        println!("  - {}", warning);
    }
    Ok(())
}

fn handle_audit(manager: &SecurityManager, action: AuditCommands, json: bool) -> Result<()> {
    match action {
        AuditCommands::Recent {
            hours,
            event_type,
            user,
            count,
        } => {
            let event_type = event_type
                .map(|t| t.parse::<AuditEventType>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let mut events = manager
                .audit()
                .get_recent_events(hours, event_type, user.as_deref())?;
            events.truncate(count);

            if json {
                return print_json(&events);
            }
            if events.is_empty() {
                println!("No audit entries in the last {} hours", hours);
            }
            for event in &events {
                println!("{}", event.summary());
                if let Some(error) = &event.error_message {
                    println!("    error: {}", error);
                }
            }
        }
        AuditCommands::Cleanup => {
            let removed = manager.audit().cleanup_old_logs()?;
            info!("Audit cleanup removed {} entries", removed);
            println!("🧹 Removed {} audit entries past retention", removed);
        }
        AuditCommands::Export { output, hours } => {
            let exported = manager.audit().export_logs(&output, hours)?;
            println!("📤 Exported {} audit entries to {}", exported, output.display());
        }
    }
    Ok(())
}

/// Open a session for one undo request; the user is created at the default level if new
fn operator_session(manager: &SecurityManager, user: Option<String>) -> Result<OperationContext> {
    let user = user.unwrap_or_else(whoami::username);
    let opened = manager.create_user_session(&user, None);
    match opened.session {
        Some(session) if opened.success => Ok(OperationContext::for_session(&user, &session.session_id)),
        _ => bail!(opened
            .error
            .unwrap_or_else(|| format!("Could not open a session for {}", user))),
    }
}

fn handle_undo(manager: &SecurityManager, action: UndoCommands, json: bool) -> Result<()> {
    match action {
        UndoCommands::List { user, limit } => {
            let operations = manager.list_undoable_operations(user.as_deref(), limit);
            if json {
                return print_json(&operations);
            }
            if operations.is_empty() {
                println!("No undoable operations");
            }
            for op in &operations {
                println!(
                    "{}  {}  {:<10} {}",
                    op.operation_id,
                    op.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    op.operation_type,
                    op.description
                );
            }
            Ok(())
        }
        UndoCommands::Run { operation_id, user } => {
            let ctx = operator_session(manager, user)?;
            let outcome = manager.undo_operation(&operation_id, &ctx);
            end_operator_session(manager, &ctx);
            report_undo(outcome, json)
        }
        UndoCommands::Last { user } => {
            let ctx = operator_session(manager, user)?;
            let outcome = manager.undo_last_operation(&ctx);
            end_operator_session(manager, &ctx);
            report_undo(outcome, json)
        }
    }
}

fn end_operator_session(manager: &SecurityManager, ctx: &OperationContext) {
    if let Some(session_id) = ctx.session_id.as_deref() {
        manager.end_user_session(session_id);
    }
}

fn report_undo(outcome: overseer::security::UndoOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(&outcome);
    }
    if !outcome.success {
        bail!(outcome.error.unwrap_or_else(|| "Undo failed".to_string()));
    }
    println!("↩️  {}", outcome.message);
    for warning in &outcome.warnings {
        println!("⚠️  {}", warning);
    }
    Ok(())
}

fn handle_users(manager: &SecurityManager, action: UserCommands, json: bool) -> Result<()> {
    let permissions = manager.permissions();
    match action {
        UserCommands::List => {
            let users = permissions.list_users();
            if json {
                return print_json(&users);
            }
            println!("👥 Users ({})", users.len());
            for user in &users {
                println!(
                    "  {} [{}]{}",
                    user.user_id,
                    user.permission_level,
                    if user.active { "" } else { " (inactive)" }
                );
            }
        }
        UserCommands::Add { user, level } => {
            let level: PermissionLevel = level.parse().map_err(anyhow::Error::msg)?;
            let created = permissions.create_user(&user, level)?;
            println!("✅ Created user {} at level {}", created.user_id, created.permission_level);
        }
        UserCommands::SetLevel { user, level } => {
            let level: PermissionLevel = level.parse().map_err(anyhow::Error::msg)?;
            permissions.update_user_permission_level(&user, level)?;
            println!("✅ {} is now {}", user, level);
        }
        UserCommands::Deactivate { user } => {
            permissions.deactivate_user(&user)?;
            println!("✅ Deactivated {}", user);
        }
        UserCommands::Delete { user } => {
            if !permissions.delete_user(&user)? {
                bail!("Unknown user: {}", user);
            }
            println!("✅ Deleted {}", user);
        }
    }
    Ok(())
}

fn init_security_config(paths: &SecurityPaths, level: &str, force: bool) -> Result<()> {
    let security_level: SecurityLevel = level.parse().map_err(anyhow::Error::msg)?;
    if paths.config_file.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            paths.config_file.display()
        );
    }

    let config = SecurityConfig {
        security_level,
        ..Default::default()
    };
    config.save(&paths.config_file)?;

    println!("✅ Security configuration written to {}", paths.config_file.display());
    println!("Security Level: {}", security_level);
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
        )
        .with(env_filter)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}
