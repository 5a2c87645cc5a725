//! Command, URL and file path validation
//!
//! Sanitizes proposed command strings and classifies them against the current policy.
//! Checks run in a fixed order and the first failing check decides the message; softer
//! findings accumulate as warnings on the [`SecurityAssessment`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::config::SharedConfig;
use super::types::RiskLevel;

/// Maximum number of shell tokens in one command
pub const MAX_ARGUMENTS: usize = 50;

/// Maximum length of a single shell token
pub const MAX_ARGUMENT_LENGTH: usize = 1000;

/// Risk assessment computed for every validation call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAssessment {
    pub risk_level: RiskLevel,
    pub warnings: Vec<String>,
    pub blocked_reason: Option<String>,
    pub requires_confirmation: bool,
    pub requires_admin: bool,
    /// Command or path after sanitization
    pub sanitized: String,
}

/// Outcome of a validation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Rejection message, `None` when valid
    pub message: Option<String>,
    pub assessment: SecurityAssessment,
}

impl ValidationResult {
    fn accept(assessment: SecurityAssessment) -> Self {
        Self {
            is_valid: true,
            message: None,
            assessment,
        }
    }

    fn reject(mut assessment: SecurityAssessment, risk: RiskLevel, message: String) -> Self {
        assessment.risk_level.raise_to(risk);
        assessment.blocked_reason = Some(message.clone());
        Self {
            is_valid: false,
            message: Some(message),
            assessment,
        }
    }
}

struct NamedPattern {
    regex: Regex,
    description: &'static str,
}

fn compile(patterns: &[(&str, &'static str)]) -> Vec<NamedPattern> {
    patterns
        .iter()
        .map(|(pattern, description)| NamedPattern {
            regex: Regex::new(pattern).expect("Invalid regex pattern"),
            description,
        })
        .collect()
}

/// Patterns that reject a command outright
static DANGEROUS_PATTERNS: Lazy<Vec<NamedPattern>> = Lazy::new(|| {
    compile(&[
        (
            r"(?i)\brm\s+(?:-[a-z]+\s+)*-[a-z]*(?:r[a-z]*f|f[a-z]*r)[a-z]*\s+(?:/|/\*|~|~/|\*|\$HOME)(?:\s|$)",
            "recursive forced removal of a root, home or wildcard target",
        ),
        (r"(?i)\bmkfs(?:\.[a-z0-9]+)?\b", "filesystem formatting"),
        (r"(?i)\bdd\s+[^;&|]*\bof=/dev/", "raw write to a block device"),
        (r">\s*/dev/(?:sd|hd|nvme|disk|mmcblk)", "redirect into a block device"),
        (r":\(\)\s*\{.*\};\s*:", "fork bomb"),
        (r"(?i)\bchmod\s+(?:-R\s+)?[0-7]*777\s+/(?:\s|$)", "world-writable filesystem root"),
        (r"(?i)\bsudo\s+(?:su\b|-i\b|-s\b|bash\b|sh\b)", "privilege escalation to a root shell"),
        (r"(?i)(?:^|[;&|]\s*)su(?:\s+-\s*|\s+root\b|\s*$)", "switch to the root user"),
        (r"(?i)\b(?:systemctl|service)\s+(?:stop|disable|mask)\b", "stopping a system service"),
        (r"(?i)(?:^|[;&|]\s*|sudo\s+)(?:shutdown|reboot|halt|poweroff)\b", "changing the machine power state"),
        (
            r"(?i)\b(?:curl|wget)\b[^|]*\|\s*(?:sudo\s+)?(?:ba|z|k|da)?sh\b",
            "piping a download into a shell",
        ),
    ])
});

/// Patterns that raise risk and add a warning without rejecting
static INJECTION_PATTERNS: Lazy<Vec<NamedPattern>> = Lazy::new(|| {
    compile(&[
        (r";", "command chaining with ';'"),
        (r"&&|\|\|", "conditional command chaining"),
        (r"(?:^|[^|])\|(?:[^|]|$)", "pipe into another command"),
        (r"`", "backtick command substitution"),
        (r"\$\(", "command substitution"),
        (r"\$\{", "variable expansion"),
        (r"(?:^|\s)\d?>>?\s*\S|<\s*\S", "input/output redirection"),
        (r"\.\./|\.\.\\", "path traversal"),
        (
            r"(?i);\s*(?:drop|delete|insert|update|select|union|alter|truncate)\b",
            "SQL keyword after a statement separator",
        ),
    ])
});

/// Shell metacharacters that may not appear inside a single argument
const ARGUMENT_METACHARACTERS: &[&str] = &["`", "$(", "<(", ">("];

/// Characters that may not appear in a file path
const PATH_METACHARACTERS: &[char] = &[';', '|', '&', '$', '`', '<', '>', '\n', '\r'];

static PATH_TRAVERSAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[/\\])\.\.(?:[/\\]|$)").expect("Invalid regex pattern"));

static PATH_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""([^"]+)"|'([^']+)'|((?:~|/)[^\s;&|<>'"`]*)"#).expect("Invalid regex pattern")
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("Invalid regex pattern"));
static REPEATED_SEMICOLONS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r";(?:\s*;)+").expect("Invalid regex pattern"));
static REPEATED_AMPERSANDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&{3,}").expect("Invalid regex pattern"));
static REPEATED_PIPES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\|{3,}").expect("Invalid regex pattern"));

/// Validates commands, URLs and paths against the shared policy
#[derive(Debug, Clone)]
pub struct CommandValidator {
    config: SharedConfig,
}

impl CommandValidator {
    /// Create a validator reading from `config`
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }

    /// Strip control characters and collapse whitespace and repeated separators
    pub fn sanitize_command(command: &str) -> String {
        let stripped: String = command
            .chars()
            .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
            .filter(|c| !c.is_control())
            .collect();

        let collapsed = WHITESPACE.replace_all(&stripped, " ");
        let collapsed = REPEATED_SEMICOLONS.replace_all(&collapsed, ";");
        let collapsed = REPEATED_AMPERSANDS.replace_all(&collapsed, "&&");
        let collapsed = REPEATED_PIPES.replace_all(&collapsed, "||");
        collapsed.trim().to_string()
    }

    /// Validate a proposed command
    pub fn validate_command(&self, command: &str) -> ValidationResult {
        let config = self.config.read();
        let sanitized = Self::sanitize_command(command);
        let mut assessment = SecurityAssessment {
            sanitized: sanitized.clone(),
            ..Default::default()
        };

        if sanitized.is_empty() {
            return ValidationResult::reject(assessment, RiskLevel::Low, "Command is empty".to_string());
        }

        if let Some(entry) = config.blacklist_match(&sanitized) {
            debug!("Command rejected by blacklist entry '{}'", entry);
            return ValidationResult::reject(
                assessment,
                RiskLevel::Critical,
                format!("Command blocked by security policy: matches blacklisted pattern '{}'", entry),
            );
        }
        if !config.is_command_allowed(&sanitized) {
            return ValidationResult::reject(
                assessment,
                RiskLevel::High,
                format!(
                    "Command not in whitelist (security level {})",
                    config.security_level
                ),
            );
        }

        if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| p.regex.is_match(&sanitized)) {
            return ValidationResult::reject(
                assessment,
                RiskLevel::Critical,
                format!("Dangerous command pattern detected: {}", pattern.description),
            );
        }

        for pattern in INJECTION_PATTERNS.iter() {
            if pattern.regex.is_match(&sanitized) {
                assessment.risk_level.raise_to(RiskLevel::High);
                assessment
                    .warnings
                    .push(format!("Potential injection: {}", pattern.description));
            }
        }

        if config.requires_confirmation(&sanitized) {
            assessment.requires_confirmation = true;
            assessment.risk_level.raise_to(RiskLevel::Medium);
        }
        if config.requires_admin(&sanitized) {
            assessment.requires_admin = true;
            assessment.risk_level.raise_to(RiskLevel::High);
        }

        for path in referenced_paths(&sanitized) {
            if config.is_file_protected(&path) || config.is_path_protected(&path) {
                assessment.risk_level.raise_to(RiskLevel::High);
                assessment
                    .warnings
                    .push(format!("Command references protected path: {}", path));
            }
        }
        if sanitized.contains("/etc/") || sanitized.contains("/var/") {
            assessment.risk_level.raise_to(RiskLevel::High);
            let warning = "Command references system configuration directories".to_string();
            if !assessment.warnings.contains(&warning) {
                assessment.warnings.push(warning);
            }
        }

        if let Err(reason) = validate_arguments(&sanitized) {
            return ValidationResult::reject(assessment, RiskLevel::High, reason);
        }

        debug!(
            "Command validated with risk {} and {} warning(s)",
            assessment.risk_level,
            assessment.warnings.len()
        );
        ValidationResult::accept(assessment)
    }

    /// Validate a URL against the network policy
    pub fn validate_url(&self, url: &str) -> ValidationResult {
        let config = self.config.read();
        let mut assessment = SecurityAssessment {
            sanitized: url.trim().to_string(),
            ..Default::default()
        };

        let parsed = match Url::parse(url.trim()) {
            Ok(parsed) => parsed,
            Err(e) => {
                return ValidationResult::reject(assessment, RiskLevel::Medium, format!("Invalid URL: {}", e));
            }
        };

        let Some(domain) = parsed.host_str().map(|h| h.to_lowercase()) else {
            return ValidationResult::reject(assessment, RiskLevel::Medium, "URL has no host".to_string());
        };

        if config.is_domain_blocked(&domain) {
            return ValidationResult::reject(
                assessment,
                RiskLevel::High,
                format!("Domain is blocked: {}", domain),
            );
        }

        if config.network.require_ssl && parsed.scheme() != "https" {
            return ValidationResult::reject(
                assessment,
                RiskLevel::Medium,
                format!("HTTPS required, got scheme '{}'", parsed.scheme()),
            );
        }

        if config.security_level.enforces_whitelist() && !config.is_domain_allowed(&domain) {
            return ValidationResult::reject(
                assessment,
                RiskLevel::Medium,
                format!("Domain not in whitelist: {}", domain),
            );
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            assessment.risk_level.raise_to(RiskLevel::Medium);
            assessment.warnings.push("URL embeds credentials".to_string());
        }

        ValidationResult::accept(assessment)
    }

    /// Validate a file path against the protection policy
    pub fn validate_file_path(&self, path: &str) -> ValidationResult {
        let config = self.config.read();
        let assessment = SecurityAssessment {
            sanitized: path.trim().to_string(),
            ..Default::default()
        };

        if path.trim().is_empty() {
            return ValidationResult::reject(assessment, RiskLevel::Low, "Path is empty".to_string());
        }
        if path.contains("..") {
            return ValidationResult::reject(
                assessment,
                RiskLevel::High,
                format!("Path traversal detected in: {}", path),
            );
        }
        if config.is_file_protected(path) {
            return ValidationResult::reject(
                assessment,
                RiskLevel::High,
                format!("Access to protected file denied: {}", path),
            );
        }
        if config.is_path_protected(path) {
            return ValidationResult::reject(
                assessment,
                RiskLevel::High,
                format!("Access to protected path denied: {}", path),
            );
        }
        if path.contains(PATH_METACHARACTERS) {
            return ValidationResult::reject(
                assessment,
                RiskLevel::Medium,
                format!("Path contains shell metacharacters: {}", path),
            );
        }

        ValidationResult::accept(assessment)
    }
}

/// Quoted strings and absolute or home-relative path tokens in a command
fn referenced_paths(command: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for captures in PATH_TOKENS.captures_iter(command) {
        let token = captures
            .get(1)
            .or_else(|| captures.get(2))
            .or_else(|| captures.get(3))
            .map(|m| m.as_str().trim());
        if let Some(token) = token {
            if (token.starts_with('/') || token.starts_with('~')) && !paths.iter().any(|p| p == token) {
                paths.push(token.to_string());
            }
        }
    }
    paths
}

/// Shell-tokenize the command and check argument shape
fn validate_arguments(command: &str) -> std::result::Result<(), String> {
    let tokens = shell_words::split(command).map_err(|e| format!("Invalid shell syntax: {}", e))?;

    if tokens.len() > MAX_ARGUMENTS {
        return Err(format!(
            "Too many arguments: {} (maximum {})",
            tokens.len(),
            MAX_ARGUMENTS
        ));
    }

    for token in &tokens {
        if token.len() > MAX_ARGUMENT_LENGTH {
            return Err(format!(
                "Argument too long: {} characters (maximum {})",
                token.len(),
                MAX_ARGUMENT_LENGTH
            ));
        }
        if let Some(meta) = ARGUMENT_METACHARACTERS.iter().find(|m| token.contains(*m)) {
            return Err(format!("Argument contains shell metacharacter '{}': {}", meta, token));
        }
        if PATH_TRAVERSAL.is_match(token) {
            return Err(format!("Argument contains path traversal: {}", token));
        }
    }

    Ok(())
}
