//! Security configuration for Overseer
//!
//! Declarative policy data (command lists, protected paths, network rules, audit and
//! encryption settings) plus the lookup predicates every other component consults.
//! All matching here is plain substring containment, not globbing or regex.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::types::{PermissionLevel, SandboxMode, SecurityLevel};
use crate::error::{OverseerError, Result};
use crate::utils::{ensure_parent_dir, expand_path, normalize_path, overseer_home};

/// File name of the security configuration inside the Overseer home
pub const CONFIG_FILE_NAME: &str = "security_config.json";

/// Policy shared between the facade and the components that read it
pub type SharedConfig = Arc<RwLock<SecurityConfig>>;

fn string_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Command execution policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPolicy {
    /// Commands allowed at HIGH/CRITICAL security level (substring match)
    pub whitelist: BTreeSet<String>,
    /// Commands always rejected (substring match, wins over the whitelist)
    pub blacklist: BTreeSet<String>,
    /// Commands that need explicit operator confirmation
    pub require_confirmation: BTreeSet<String>,
    /// Commands that need admin rights
    pub require_admin: BTreeSet<String>,
    /// Execution timeout the caller must enforce, in seconds
    pub timeout_seconds: u64,
    /// Maximum captured output the caller should keep, in bytes
    pub max_output_bytes: usize,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            whitelist: string_set(&[
                "ls", "cat", "grep", "find", "echo", "pwd", "head", "tail", "wc", "sort",
                "uniq", "diff", "git", "ps", "df", "du", "free", "uptime", "whoami", "date",
                "uname", "which", "env", "python", "pip", "cargo", "npm", "node",
            ]),
            blacklist: string_set(&[
                "rm -rf /",
                "rm -rf /*",
                "rm -rf ~",
                "rm -rf *",
                "mkfs",
                "dd if=/dev/zero",
                "dd if=/dev/random",
                "dd if=/dev/urandom",
                "> /dev/sda",
                ":(){ :|:& };:",
                "chmod -R 777 /",
                "chown -R root /",
                "sudo su",
                "sudo -i",
                "su root",
                "shutdown",
                "reboot",
                "halt",
                "poweroff",
                "init 0",
                "init 6",
                "format c:",
            ]),
            require_confirmation: string_set(&[
                "rm ",
                "mv ",
                "cp -r",
                "chmod ",
                "chown ",
                "kill ",
                "pkill ",
                "killall ",
                "git push",
                "git reset --hard",
                "git clean",
                "pip install",
                "npm install",
                "apt install",
                "apt-get install",
                "brew install",
                "crontab",
            ]),
            require_admin: string_set(&[
                "sudo",
                "su ",
                "systemctl",
                "service ",
                "mount",
                "umount",
                "useradd",
                "userdel",
                "usermod",
                "passwd",
                "iptables",
                "chroot",
                "visudo",
                "modprobe",
            ]),
            timeout_seconds: 30,
            max_output_bytes: 1024 * 1024, // 1MB
        }
    }
}

/// Filesystem protection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemProtection {
    /// Directories that must not be touched
    pub protected_paths: BTreeSet<String>,
    /// Individual files that must not be touched
    pub protected_files: BTreeSet<String>,
    /// Largest file a single operation may write, in megabytes
    pub max_file_size_mb: u64,
    /// Largest number of files one operation may affect
    pub max_files_per_operation: usize,
}

impl Default for SystemProtection {
    fn default() -> Self {
        Self {
            protected_paths: string_set(&[
                "/etc", "/var", "/usr", "/bin", "/sbin", "/boot", "/root", "/sys", "/proc",
                "/dev", "/lib", "/lib64", "/System", "/Library", "C:\\Windows",
                "C:\\Program Files",
            ]),
            protected_files: string_set(&[
                "/etc/passwd",
                "/etc/shadow",
                "/etc/sudoers",
                "/etc/hosts",
                "/etc/fstab",
                "~/.ssh/id_rsa",
                "~/.ssh/id_ed25519",
                "~/.ssh/authorized_keys",
                "~/.gnupg",
                "~/.overseer/encryption.key",
            ]),
            max_file_size_mb: 100,
            max_files_per_operation: 1000,
        }
    }
}

/// Network access rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSecurity {
    /// Domains allowed at HIGH/CRITICAL security level
    pub allowed_domains: BTreeSet<String>,
    /// Domains always rejected
    pub blocked_domains: BTreeSet<String>,
    /// Reject plain-HTTP URLs
    pub require_ssl: bool,
    /// Largest request body, in megabytes
    pub max_request_size_mb: u64,
    /// Request budget per minute the caller should enforce
    pub max_requests_per_minute: u32,
}

impl Default for NetworkSecurity {
    fn default() -> Self {
        Self {
            allowed_domains: string_set(&[
                "github.com",
                "api.github.com",
                "pypi.org",
                "crates.io",
                "registry.npmjs.org",
                "generativelanguage.googleapis.com",
                "localhost",
            ]),
            blocked_domains: string_set(&["malware.com", "phishing.com", "pastebin.com"]),
            require_ssl: true,
            max_request_size_mb: 10,
            max_requests_per_minute: 60,
        }
    }
}

/// Audit trail settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Whether audit events are written
    pub enabled: bool,
    /// Audit log file
    pub log_file: PathBuf,
    /// Days of events kept by the retention pass
    pub retention_days: u32,
    /// Field names whose `name=value` occurrences are redacted
    pub sensitive_fields: Vec<String>,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_file: PathBuf::from("overseer_audit.log"),
            retention_days: 90,
            sensitive_fields: vec![
                "password".to_string(),
                "token".to_string(),
                "key".to_string(),
                "secret".to_string(),
                "credential".to_string(),
            ],
        }
    }
}

/// At-rest encryption settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSettings {
    /// Whether config secrets are encrypted
    pub enabled: bool,
    /// Cipher identifier
    pub algorithm: String,
    /// Days before the master key is due for rotation
    pub key_rotation_days: u32,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: "aes-256-gcm".to_string(),
            key_rotation_days: 90,
        }
    }
}

/// Complete security policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Global strictness
    pub security_level: SecurityLevel,
    /// Level given to users created on first use
    pub default_permission_level: PermissionLevel,
    /// Declared execution posture
    pub sandbox_mode: SandboxMode,
    /// Inactivity timeout for new users' sessions, in seconds
    pub session_timeout_seconds: u64,
    pub commands: CommandPolicy,
    pub system: SystemProtection,
    pub network: NetworkSecurity,
    pub audit: AuditSettings,
    pub encryption: EncryptionSettings,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Medium,
            default_permission_level: PermissionLevel::Standard,
            sandbox_mode: SandboxMode::Validation,
            session_timeout_seconds: 3600,
            commands: CommandPolicy::default(),
            system: SystemProtection::default(),
            network: NetworkSecurity::default(),
            audit: AuditSettings::default(),
            encryption: EncryptionSettings::default(),
        }
    }
}

impl SecurityConfig {
    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        overseer_home().join(CONFIG_FILE_NAME)
    }

    /// Load the config, falling back to defaults on any problem
    ///
    /// A missing file is the normal first-run case and is silent; an unreadable or
    /// malformed file is reported with a warning.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            debug!("No security config at {:?}, using defaults", path);
            return Self::default();
        }

        match Self::try_load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load security config from {:?}: {}. Using defaults.", path, e);
                Self::default()
            }
        }
    }

    /// Load the config, reporting any error
    pub fn try_load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: SecurityConfig = serde_json::from_str(&content)?;
        if let Err(e) = config.validate() {
            warn!("Security config at {:?} has questionable values: {}", path, e);
        }
        info!("Loaded security configuration from {:?}", path);
        Ok(config)
    }

    /// Serialize the config back to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        ensure_parent_dir(path)?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        info!("Saved security configuration to {:?}", path);
        Ok(())
    }

    /// Wrap into a shared, lockable handle
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<()> {
        if self.session_timeout_seconds == 0 {
            return Err(OverseerError::config("session_timeout_seconds must be greater than zero"));
        }
        if self.commands.timeout_seconds == 0 {
            return Err(OverseerError::config("commands.timeout_seconds must be greater than zero"));
        }
        if self.commands.max_output_bytes == 0 {
            return Err(OverseerError::config("commands.max_output_bytes must be greater than zero"));
        }
        if self.audit.retention_days == 0 {
            return Err(OverseerError::config("audit.retention_days must be greater than zero"));
        }
        if self.audit.log_file.as_os_str().is_empty() {
            return Err(OverseerError::config("audit.log_file must not be empty"));
        }
        Ok(())
    }

    /// First blacklist entry contained in `command`
    pub fn blacklist_match(&self, command: &str) -> Option<&str> {
        let lowered = command.to_lowercase();
        self.commands
            .blacklist
            .iter()
            .find(|entry| !entry.is_empty() && lowered.contains(&entry.to_lowercase()))
            .map(|entry| entry.as_str())
    }

    /// Whether `command` passes the blacklist and, when enforced, the whitelist
    pub fn is_command_allowed(&self, command: &str) -> bool {
        if self.blacklist_match(command).is_some() {
            return false;
        }

        if self.security_level.enforces_whitelist() {
            let lowered = command.to_lowercase();
            return self
                .commands
                .whitelist
                .iter()
                .any(|entry| !entry.is_empty() && lowered.contains(&entry.to_lowercase()));
        }

        true
    }

    /// Whether `command` needs operator confirmation
    pub fn requires_confirmation(&self, command: &str) -> bool {
        contains_any(command, &self.commands.require_confirmation)
    }

    /// Whether `command` needs admin rights
    pub fn requires_admin(&self, command: &str) -> bool {
        contains_any(command, &self.commands.require_admin)
    }

    /// Whether `path` falls under a protected directory
    pub fn is_path_protected(&self, path: &str) -> bool {
        let normalized = normalize_path(path);
        self.system
            .protected_paths
            .iter()
            .any(|protected| path_contains(&normalized, protected))
    }

    /// Whether `path` names a protected file
    pub fn is_file_protected(&self, path: &str) -> bool {
        let normalized = normalize_path(path);
        self.system
            .protected_files
            .iter()
            .any(|protected| path_contains(&normalized, protected))
    }

    /// Whether `domain` or one of its parents is blocked
    pub fn is_domain_blocked(&self, domain: &str) -> bool {
        domain_in(domain, &self.network.blocked_domains)
    }

    /// Whether `domain` or one of its parents is allowed
    pub fn is_domain_allowed(&self, domain: &str) -> bool {
        domain_in(domain, &self.network.allowed_domains)
    }
}

fn contains_any(command: &str, entries: &BTreeSet<String>) -> bool {
    let lowered = command.to_lowercase();
    entries
        .iter()
        .any(|entry| !entry.is_empty() && lowered.contains(&entry.to_lowercase()))
}

fn path_contains(normalized: &str, protected: &str) -> bool {
    if protected.is_empty() {
        return false;
    }
    let expanded = expand_path(protected);
    let expanded = expanded.to_string_lossy();
    normalized == expanded || normalized.contains(expanded.as_ref())
}

fn domain_in(domain: &str, domains: &BTreeSet<String>) -> bool {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    if domain.is_empty() {
        return false;
    }
    domains.iter().any(|entry| {
        let entry = entry.trim().to_lowercase();
        !entry.is_empty() && (domain == entry || domain.ends_with(&format!(".{}", entry)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist_wins_over_whitelist() {
        let mut config = SecurityConfig::default();
        config.security_level = SecurityLevel::High;
        config.commands.whitelist.insert("rm".to_string());

        assert!(!config.is_command_allowed("rm -rf /"));
        assert_eq!(config.blacklist_match("sudo RM -RF /"), Some("rm -rf /"));
    }

    #[test]
    fn test_whitelist_enforced_only_at_high_levels() {
        let mut config = SecurityConfig::default();
        assert!(config.is_command_allowed("terraform apply"));

        config.security_level = SecurityLevel::Critical;
        assert!(!config.is_command_allowed("terraform apply"));
        assert!(config.is_command_allowed("ls -la"));
    }

    #[test]
    fn test_confirmation_and_admin_sets() {
        let config = SecurityConfig::default();
        assert!(config.requires_confirmation("rm notes.txt"));
        assert!(config.requires_admin("sudo apt update"));
        assert!(!config.requires_admin("ls"));
    }

    #[test]
    fn test_protected_paths_use_substring_semantics() {
        let config = SecurityConfig::default();
        assert!(config.is_path_protected("/etc/nginx/nginx.conf"));
        assert!(config.is_path_protected("/home/user/../../var/log"));
        assert!(config.is_file_protected("/etc/shadow"));
        assert!(!config.is_file_protected("/home/user/notes.txt"));
    }

    #[test]
    fn test_domain_matching_includes_subdomains() {
        let config = SecurityConfig::default();
        assert!(config.is_domain_blocked("malware.com"));
        assert!(config.is_domain_blocked("cdn.malware.com"));
        assert!(!config.is_domain_blocked("notmalware.com"));
        assert!(config.is_domain_allowed("api.github.com"));
    }

    #[test]
    fn test_missing_keys_fall_back_and_unknown_keys_ignored() {
        let json = r#"{
            "security_level": "high",
            "commands": { "blacklist": ["format"] },
            "some_future_key": 42
        }"#;
        let config: SecurityConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.security_level, SecurityLevel::High);
        assert_eq!(config.commands.blacklist.len(), 1);
        assert_eq!(config.commands.timeout_seconds, 30);
        assert_eq!(config.system, SystemProtection::default());
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let loaded = SecurityConfig::load(&path);
        assert_eq!(loaded, SecurityConfig::default());

        let mut config = SecurityConfig::default();
        config.security_level = SecurityLevel::Critical;
        config.save(&path).unwrap();
        assert_eq!(SecurityConfig::load(&path).security_level, SecurityLevel::Critical);

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(SecurityConfig::load(&path), SecurityConfig::default());
        assert!(SecurityConfig::try_load(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_retention() {
        let mut config = SecurityConfig::default();
        assert!(config.validate().is_ok());
        config.audit.retention_days = 0;
        assert!(config.validate().is_err());
    }
}
