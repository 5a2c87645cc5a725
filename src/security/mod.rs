//! Security subsystem for Overseer
//!
//! Every externally visible action the assistant takes passes through
//! [`SecurityManager`], which combines:
//! - policy validation of commands, paths and URLs
//! - pattern and rate based threat detection
//! - users, permission levels and sessions
//! - an append-only JSON-lines audit trail
//! - undo snapshots of mutating operations
//! - encryption of secrets at rest

pub mod audit;
pub mod config;
pub mod encryption;
pub mod manager;
pub mod permissions;
pub mod threat_detection;
pub mod types;
pub mod undo;
pub mod validator;

pub use audit::{
    AuditContext, AuditEvent, AuditEventType, AuditLogger, AuditQuery, AuditSummary, Redactor,
};
pub use config::{
    AuditSettings, CommandPolicy, EncryptionSettings, NetworkSecurity, SecurityConfig,
    SharedConfig, SystemProtection,
};
pub use encryption::{EncryptionManager, EncryptionStatus};
pub use manager::{
    ActionOutcome, FileOperationKind, HousekeepingReport, OperationContext, RejectionKind,
    SecurityManager, SecurityPaths, SecurityStatus, SecuritySummary, SessionOutcome,
    UndoOutcome, ValidationOutcome,
};
pub use permissions::{Permission, PermissionManager, Session, UserPermissions};
pub use threat_detection::{
    BlockedSource, ThreatAction, ThreatDetectionConfig, ThreatDetectionStatistics, ThreatDetector,
    ThreatEvent, ThreatType,
};
pub use types::{PermissionLevel, RiskLevel, SandboxMode, SecurityLevel};
pub use undo::{FileAction, OperationOwner, OperationType, OriginalState, UndoManager, UndoOperation, UndoResult};
pub use validator::{CommandValidator, SecurityAssessment, ValidationResult};
