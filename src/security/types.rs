//! Shared security enumerations
//!
//! Ordinal levels used by validation outcomes, threat events, configuration and the
//! permission model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordinal risk attached to a validation or threat outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Raise this level to at least `floor`
    pub fn raise_to(&mut self, floor: RiskLevel) {
        if floor > *self {
            *self = floor;
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("Unknown risk level: {}", other)),
        }
    }
}

/// Global strictness of the command policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl SecurityLevel {
    /// HIGH and CRITICAL enforce the command and domain whitelists
    pub fn enforces_whitelist(&self) -> bool {
        matches!(self, SecurityLevel::High | SecurityLevel::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Low => "low",
            SecurityLevel::Medium => "medium",
            SecurityLevel::High => "high",
            SecurityLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(SecurityLevel::Low),
            "medium" => Ok(SecurityLevel::Medium),
            "high" => Ok(SecurityLevel::High),
            "critical" => Ok(SecurityLevel::Critical),
            other => Err(format!("Unknown security level: {}", other)),
        }
    }
}

/// Coarse permission tier; each tier's default capability set contains the previous one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    ReadOnly,
    Limited,
    #[default]
    Standard,
    Admin,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::ReadOnly => "read_only",
            PermissionLevel::Limited => "limited",
            PermissionLevel::Standard => "standard",
            PermissionLevel::Admin => "admin",
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "read_only" | "readonly" => Ok(PermissionLevel::ReadOnly),
            "limited" => Ok(PermissionLevel::Limited),
            "standard" => Ok(PermissionLevel::Standard),
            "admin" => Ok(PermissionLevel::Admin),
            other => Err(format!("Unknown permission level: {}", other)),
        }
    }
}

/// Declared execution posture; recorded in config and reported to callers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    DryRun,
    Simulation,
    Isolated,
    #[default]
    Validation,
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxMode::DryRun => "dry_run",
            SandboxMode::Simulation => "simulation",
            SandboxMode::Isolated => "isolated",
            SandboxMode::Validation => "validation",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering_and_raise() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::Medium > RiskLevel::Low);

        let mut risk = RiskLevel::Medium;
        risk.raise_to(RiskLevel::Low);
        assert_eq!(risk, RiskLevel::Medium);
        risk.raise_to(RiskLevel::High);
        assert_eq!(risk, RiskLevel::High);
    }

    #[test]
    fn test_level_serde_names() {
        assert_eq!(serde_json::to_string(&RiskLevel::Critical).unwrap(), "\"critical\"");
        assert_eq!(serde_json::to_string(&PermissionLevel::ReadOnly).unwrap(), "\"read_only\"");
        assert_eq!(serde_json::to_string(&SandboxMode::DryRun).unwrap(), "\"dry_run\"");
        assert_eq!("read-only".parse::<PermissionLevel>().unwrap(), PermissionLevel::ReadOnly);
        assert!("bogus".parse::<SecurityLevel>().is_err());
    }
}
