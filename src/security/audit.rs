//! Audit logging for Overseer
//!
//! Every security decision is written as one line to an append-only log file:
//! `<timestamp> - overseer.audit - <LEVEL> - <json event>`. Values of sensitive fields are
//! redacted before an event is buffered or written. Queries re-parse the file, so the log
//! is the only source of truth and survives restarts.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::config::AuditSettings;
use super::threat_detection::ThreatEvent;
use super::types::RiskLevel;
use crate::error::{OverseerError, Result};
use crate::utils::{ensure_parent_dir, SharedClock};

/// Logger name embedded in every line
pub const AUDIT_LOGGER_NAME: &str = "overseer.audit";

/// Events held in memory before the buffer is flushed
pub const AUDIT_BUFFER_CAPACITY: usize = 100;

const LINE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Types of events to audit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Command validation and execution
    CommandExecution,
    /// File reads, writes and deletions
    FileOperation,
    /// Outbound requests
    NetworkOperation,
    /// Session creation and teardown
    Authentication,
    /// User level and capability changes
    PermissionChange,
    /// Policy rejections and denials
    SecurityViolation,
    /// Threat detector findings
    ThreatDetected,
    /// Undo attempts
    UndoOperation,
    /// Security configuration changes
    ConfigChange,
    /// System events (startup, housekeeping)
    System,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::CommandExecution => "command_execution",
            AuditEventType::FileOperation => "file_operation",
            AuditEventType::NetworkOperation => "network_operation",
            AuditEventType::Authentication => "authentication",
            AuditEventType::PermissionChange => "permission_change",
            AuditEventType::SecurityViolation => "security_violation",
            AuditEventType::ThreatDetected => "threat_detected",
            AuditEventType::UndoOperation => "undo_operation",
            AuditEventType::ConfigChange => "config_change",
            AuditEventType::System => "system",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        [
            AuditEventType::CommandExecution,
            AuditEventType::FileOperation,
            AuditEventType::NetworkOperation,
            AuditEventType::Authentication,
            AuditEventType::PermissionChange,
            AuditEventType::SecurityViolation,
            AuditEventType::ThreatDetected,
            AuditEventType::UndoOperation,
            AuditEventType::ConfigChange,
            AuditEventType::System,
        ]
        .into_iter()
        .find(|t| t.as_str() == wanted)
        .ok_or_else(|| format!("Unknown audit event type: {}", s))
    }
}

/// Who performed an audited action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditContext {
    pub fn system() -> Self {
        Self {
            user_id: Some("system".to_string()),
            ..Default::default()
        }
    }

    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        }
    }
}

/// A single audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Command, path or URL the event is about
    pub command: Option<String>,
    pub result: Option<String>,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            event_type,
            user_id: None,
            session_id: None,
            command: None,
            result: None,
            risk_level: RiskLevel::Low,
            warnings: Vec::new(),
            success: true,
            error_message: None,
            duration_ms: None,
            ip_address: None,
            user_agent: None,
            details: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, context: &AuditContext) -> Self {
        self.user_id = context.user_id.clone();
        self.session_id = context.session_id.clone();
        self.ip_address = context.ip_address.clone();
        self.user_agent = context.user_agent.clone();
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_risk(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_warnings(mut self, warnings: &[String]) -> Self {
        self.warnings = warnings.to_vec();
        self
    }

    /// Set the success flag and error message
    pub fn with_outcome(mut self, success: bool, error: Option<&str>) -> Self {
        self.success = success;
        self.error_message = error.map(str::to_string);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Log level used for the line prefix
    pub fn level(&self) -> &'static str {
        if self.risk_level == RiskLevel::Critical {
            "ERROR"
        } else if !self.success || self.risk_level == RiskLevel::High {
            "WARNING"
        } else {
            "INFO"
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        let status = if self.success { "ok" } else { "failed" };
        let user = self.user_id.as_deref().unwrap_or("-");
        let subject = self.command.as_deref().unwrap_or("");
        format!(
            "{} [{}] {} {} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.risk_level,
            self.event_type,
            user,
            status,
            subject
        )
        .trim_end()
        .to_string()
    }
}

/// Filters for reading events back from the log
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub event_type: Option<AuditEventType>,
    pub user_id: Option<String>,
    pub min_risk: Option<RiskLevel>,
    pub failures_only: bool,
    /// Keep at most this many of the newest matches
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        if self.since.map(|since| event.timestamp < since).unwrap_or(false) {
            return false;
        }
        if self.until.map(|until| event.timestamp > until).unwrap_or(false) {
            return false;
        }
        if self.event_type.map(|t| t != event.event_type).unwrap_or(false) {
            return false;
        }
        if let Some(user_id) = &self.user_id {
            if event.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if self.min_risk.map(|risk| event.risk_level < risk).unwrap_or(false) {
            return false;
        }
        !(self.failures_only && event.success)
    }
}

/// Aggregated view over a time window of audit events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub period_hours: u64,
    pub total_events: usize,
    pub events_by_type: BTreeMap<String, usize>,
    pub events_by_risk: BTreeMap<String, usize>,
    pub failed_operations: usize,
    pub security_violations: usize,
    pub threats_detected: usize,
    pub high_risk_events: usize,
    pub unique_users: BTreeSet<String>,
}

/// Redacts `name=value` and `name: value` pairs for sensitive field names
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Vec<Regex>,
}

impl Redactor {
    pub fn new(fields: &[String]) -> Result<Self> {
        let patterns = fields
            .iter()
            .filter(|field| !field.trim().is_empty())
            .map(|field| {
                Regex::new(&format!(
                    r#"(?i)([A-Za-z0-9_\-]*{}[A-Za-z0-9_\-]*)\s*[=:]\s*("[^"]*"|'[^']*'|\S+)"#,
                    regex::escape(field.trim())
                ))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn redact(&self, text: &str) -> String {
        let mut redacted = text.to_string();
        for pattern in &self.patterns {
            redacted = pattern.replace_all(&redacted, "${1}=[REDACTED]").into_owned();
        }
        redacted
    }

    fn redact_event(&self, event: &mut AuditEvent) {
        for field in [&mut event.command, &mut event.result, &mut event.error_message] {
            if let Some(value) = field {
                *value = self.redact(value);
            }
        }
        for warning in &mut event.warnings {
            *warning = self.redact(warning);
        }
        for value in event.details.values_mut() {
            *value = self.redact(value);
        }
    }
}

/// Append-only audit trail
#[derive(Debug)]
pub struct AuditLogger {
    enabled: bool,
    retention_days: u32,
    log_path: PathBuf,
    redactor: Redactor,
    buffer: Mutex<Vec<AuditEvent>>,
    file_lock: Mutex<()>,
    clock: SharedClock,
}

impl AuditLogger {
    /// Create a logger writing to `log_path`
    pub fn new(settings: &AuditSettings, log_path: PathBuf, clock: SharedClock) -> Result<Self> {
        let redactor = Redactor::new(&settings.sensitive_fields)?;
        if settings.enabled {
            ensure_parent_dir(&log_path)?;
        }
        info!(
            "Audit logging {} ({:?}, retention {} days)",
            if settings.enabled { "enabled" } else { "disabled" },
            log_path,
            settings.retention_days
        );

        Ok(Self {
            enabled: settings.enabled,
            retention_days: settings.retention_days,
            log_path,
            redactor,
            buffer: Mutex::new(Vec::with_capacity(AUDIT_BUFFER_CAPACITY)),
            file_lock: Mutex::new(()),
            clock,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Start an event stamped with the logger's clock
    pub fn event(&self, event_type: AuditEventType) -> AuditEvent {
        AuditEvent::new(event_type, self.clock.now())
    }

    /// Redact, buffer and append an event
    pub fn log_event(&self, mut event: AuditEvent) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        self.redactor.redact_event(&mut event);
        let json = serde_json::to_string(&event)?;
        let line = format!(
            "{} - {} - {} - {}\n",
            event.timestamp.format(LINE_TIMESTAMP_FORMAT),
            AUDIT_LOGGER_NAME,
            event.level(),
            json
        );

        {
            let _guard = self.file_lock.lock();
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .map_err(|e| {
                    error!("Failed to open audit log {:?}: {}", self.log_path, e);
                    OverseerError::audit(format!("Failed to open audit log: {}", e))
                })?;
            file.write_all(line.as_bytes())?;
        }

        debug!("Audit: {}", event.summary());

        let mut buffer = self.buffer.lock();
        buffer.push(event);
        if buffer.len() >= AUDIT_BUFFER_CAPACITY {
            let drained: Vec<AuditEvent> = buffer.drain(..).collect();
            drop(buffer);
            self.flush_buffer(drained);
        }
        Ok(())
    }

    /// Hand a full buffer to the external sink; there is none yet, so this only traces
    fn flush_buffer(&self, events: Vec<AuditEvent>) {
        debug!("Flushed {} buffered audit events", events.len());
    }

    /// Events currently held in memory, oldest first
    pub fn buffered_events(&self) -> Vec<AuditEvent> {
        self.buffer.lock().clone()
    }

    pub fn log_command_execution(
        &self,
        context: &AuditContext,
        command: &str,
        risk_level: RiskLevel,
        warnings: &[String],
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        self.log_event(
            self.event(AuditEventType::CommandExecution)
                .with_context(context)
                .with_command(command)
                .with_risk(risk_level)
                .with_warnings(warnings)
                .with_outcome(success, error),
        )
    }

    pub fn log_file_operation(
        &self,
        context: &AuditContext,
        operation: &str,
        path: &str,
        risk_level: RiskLevel,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        self.log_event(
            self.event(AuditEventType::FileOperation)
                .with_context(context)
                .with_command(path)
                .with_detail("operation", operation)
                .with_risk(risk_level)
                .with_outcome(success, error),
        )
    }

    pub fn log_network_operation(
        &self,
        context: &AuditContext,
        url: &str,
        risk_level: RiskLevel,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        self.log_event(
            self.event(AuditEventType::NetworkOperation)
                .with_context(context)
                .with_command(url)
                .with_risk(risk_level)
                .with_outcome(success, error),
        )
    }

    pub fn log_authentication(
        &self,
        context: &AuditContext,
        action: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let risk = if success { RiskLevel::Low } else { RiskLevel::Medium };
        self.log_event(
            self.event(AuditEventType::Authentication)
                .with_context(context)
                .with_result(action)
                .with_risk(risk)
                .with_outcome(success, error),
        )
    }

    pub fn log_permission_change(
        &self,
        context: &AuditContext,
        target_user: &str,
        change: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        self.log_event(
            self.event(AuditEventType::PermissionChange)
                .with_context(context)
                .with_result(change)
                .with_detail("target_user", target_user)
                .with_risk(RiskLevel::Medium)
                .with_outcome(success, error),
        )
    }

    /// Record a rejection or denial; always a failed event
    pub fn log_security_violation(
        &self,
        context: &AuditContext,
        subject: &str,
        reason: &str,
        risk_level: RiskLevel,
    ) -> Result<()> {
        self.log_event(
            self.event(AuditEventType::SecurityViolation)
                .with_context(context)
                .with_command(subject)
                .with_risk(risk_level)
                .with_outcome(false, Some(reason)),
        )
    }

    pub fn log_threat(&self, context: &AuditContext, threat: &ThreatEvent) -> Result<()> {
        let mut event = self
            .event(AuditEventType::ThreatDetected)
            .with_context(context)
            .with_result(threat.description.clone())
            .with_risk(threat.risk_level)
            .with_detail("threat_type", threat.threat_type.as_str())
            .with_detail("source", threat.source.clone())
            .with_detail("action", threat.action_taken.as_str());
        if let Some(command) = threat.details.get("command") {
            event = event.with_command(command.clone());
        }
        event.timestamp = threat.timestamp;
        self.log_event(event)
    }

    pub fn log_undo_operation(
        &self,
        context: &AuditContext,
        operation_id: &str,
        description: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        self.log_event(
            self.event(AuditEventType::UndoOperation)
                .with_context(context)
                .with_command(description)
                .with_detail("operation_id", operation_id)
                .with_risk(RiskLevel::Medium)
                .with_outcome(success, error),
        )
    }

    pub fn log_config_change(
        &self,
        context: &AuditContext,
        key: &str,
        old_value: &str,
        new_value: &str,
    ) -> Result<()> {
        self.log_event(
            self.event(AuditEventType::ConfigChange)
                .with_context(context)
                .with_command(key)
                .with_result(format!("{} -> {}", old_value, new_value))
                .with_risk(RiskLevel::High),
        )
    }

    pub fn log_system(&self, message: &str) -> Result<()> {
        self.log_event(
            self.event(AuditEventType::System)
                .with_context(&AuditContext::system())
                .with_result(message),
        )
    }

    /// Parse the JSON payload of one log line
    fn parse_line(line: &str) -> Option<AuditEvent> {
        let start = line.find('{')?;
        serde_json::from_str(&line[start..]).ok()
    }

    /// Raw lines of the log, without their terminators; bytes need not be UTF-8
    fn read_raw_lines(&self) -> Result<Vec<Vec<u8>>> {
        let file = fs::File::open(&self.log_path)?;
        let mut reader = BufReader::new(file);
        let mut lines = Vec::new();
        loop {
            let mut line = Vec::new();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            lines.push(line);
        }
        Ok(lines)
    }

    fn parse_raw_line(line: &[u8]) -> Option<AuditEvent> {
        Self::parse_line(&String::from_utf8_lossy(line))
    }

    fn read_events(&self) -> Result<Vec<AuditEvent>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let _guard = self.file_lock.lock();
        Ok(self
            .read_raw_lines()?
            .iter()
            .filter_map(|line| Self::parse_raw_line(line))
            .collect())
    }

    /// Matching events, newest first
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let mut events: Vec<AuditEvent> = self
            .read_events()?
            .into_iter()
            .filter(|event| query.matches(event))
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    /// Events from the last `hours`, newest first
    pub fn get_recent_events(
        &self,
        hours: u64,
        event_type: Option<AuditEventType>,
        user_id: Option<&str>,
    ) -> Result<Vec<AuditEvent>> {
        self.query(&AuditQuery {
            since: Some(self.clock.now() - Duration::hours(hours as i64)),
            event_type,
            user_id: user_id.map(str::to_string),
            ..Default::default()
        })
    }

    /// Aggregate the last `hours` of events
    pub fn get_security_summary(&self, hours: u64) -> Result<AuditSummary> {
        let events = self.get_recent_events(hours, None, None)?;
        let mut summary = AuditSummary {
            period_hours: hours,
            total_events: events.len(),
            ..Default::default()
        };

        for event in &events {
            *summary
                .events_by_type
                .entry(event.event_type.to_string())
                .or_insert(0) += 1;
            *summary
                .events_by_risk
                .entry(event.risk_level.to_string())
                .or_insert(0) += 1;
            if !event.success {
                summary.failed_operations += 1;
            }
            if event.risk_level >= RiskLevel::High {
                summary.high_risk_events += 1;
            }
            match event.event_type {
                AuditEventType::SecurityViolation => summary.security_violations += 1,
                AuditEventType::ThreatDetected => summary.threats_detected += 1,
                _ => {}
            }
            if let Some(user_id) = &event.user_id {
                summary.unique_users.insert(user_id.clone());
            }
        }
        Ok(summary)
    }

    /// Drop events older than the retention period; returns how many were removed
    ///
    /// Lines that cannot be parsed are kept.
    pub fn cleanup_old_logs(&self) -> Result<usize> {
        if !self.log_path.exists() {
            return Ok(0);
        }

        let cutoff = self.clock.now() - Duration::days(self.retention_days as i64);
        let _guard = self.file_lock.lock();

        let mut kept = Vec::new();
        let mut removed = 0;
        for line in self.read_raw_lines()? {
            match Self::parse_raw_line(&line) {
                Some(event) if event.timestamp < cutoff => removed += 1,
                _ => {
                    kept.extend_from_slice(&line);
                    kept.push(b'\n');
                }
            }
        }

        if removed > 0 {
            fs::write(&self.log_path, kept)?;
            info!("Removed {} audit events older than {} days", removed, self.retention_days);
        }
        Ok(removed)
    }

    /// Write matching events to `destination` as a JSON array; returns the count
    pub fn export_logs(&self, destination: &Path, hours: Option<u64>) -> Result<usize> {
        let mut events = match hours {
            Some(hours) => self.get_recent_events(hours, None, None)?,
            None => self.query(&AuditQuery::default())?,
        };
        events.reverse();

        ensure_parent_dir(destination)?;
        fs::write(destination, serde_json::to_string_pretty(&events)?).map_err(|e| {
            warn!("Failed to export audit log to {:?}: {}", destination, e);
            OverseerError::from(e)
        })?;
        info!("Exported {} audit events to {:?}", events.len(), destination);
        Ok(events.len())
    }
}
