//! Undo support for Overseer
//!
//! Before a mutating operation proceeds, a snapshot of the state it will change is taken:
//! a backup copy for files and directories, the octal mode for permission changes, the
//! previous value for config keys, and a plain record for commands. Snapshots are kept in
//! a JSON history file and can be reversed later.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{OverseerError, Result};
use crate::utils::{ensure_parent_dir, overseer_home, SharedClock};

/// File name of the undo history inside the Overseer home
pub const UNDO_HISTORY_FILE_NAME: &str = "undo_history.json";

/// Directory name for backups inside the Overseer home
pub const BACKUP_DIR_NAME: &str = "backups";

/// Kind of operation an undo record covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Command,
    File,
    Directory,
    Permission,
    Config,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Command => "command",
            OperationType::File => "file",
            OperationType::Directory => "directory",
            OperationType::Permission => "permission",
            OperationType::Config => "config",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a file or directory operation does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Modify => "modify",
            FileAction::Delete => "delete",
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "create" => Ok(FileAction::Create),
            "modify" | "write" => Ok(FileAction::Modify),
            "delete" => Ok(FileAction::Delete),
            other => Err(format!("Unknown file action: {}", other)),
        }
    }
}

/// Snapshot of the state an operation changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OriginalState {
    Command {
        command: String,
        working_dir: Option<String>,
    },
    File {
        path: PathBuf,
        action: FileAction,
        existed: bool,
        backup_path: Option<PathBuf>,
    },
    Directory {
        path: PathBuf,
        action: FileAction,
        existed: bool,
        backup_path: Option<PathBuf>,
    },
    Permission {
        path: PathBuf,
        /// Octal mode string, e.g. "644"
        original_mode: String,
    },
    Config {
        key: String,
        original_value: serde_json::Value,
        config_path: Option<PathBuf>,
    },
}

impl OriginalState {
    pub fn operation_type(&self) -> OperationType {
        match self {
            OriginalState::Command { .. } => OperationType::Command,
            OriginalState::File { .. } => OperationType::File,
            OriginalState::Directory { .. } => OperationType::Directory,
            OriginalState::Permission { .. } => OperationType::Permission,
            OriginalState::Config { .. } => OperationType::Config,
        }
    }

    pub fn backup_path(&self) -> Option<&Path> {
        match self {
            OriginalState::File { backup_path, .. } | OriginalState::Directory { backup_path, .. } => {
                backup_path.as_deref()
            }
            _ => None,
        }
    }
}

/// Who an undo record belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOwner {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl OperationOwner {
    pub fn new(user_id: Option<&str>, session_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            session_id: session_id.map(str::to_string),
        }
    }
}

/// A reversible operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoOperation {
    pub operation_id: String,
    pub operation_type: OperationType,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub original_state: OriginalState,
    pub success: bool,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub undone: bool,
    pub undone_at: Option<DateTime<Utc>>,
}

/// Result of an undo attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoResult {
    /// Whether the operation was successful
    pub success: bool,
    pub operation_id: Option<String>,
    /// Operation message
    pub message: String,
    pub warnings: Vec<String>,
    /// Any errors that occurred
    pub error: Option<String>,
}

impl UndoResult {
    fn succeeded(operation_id: &str, message: String, warnings: Vec<String>) -> Self {
        Self {
            success: true,
            operation_id: Some(operation_id.to_string()),
            message,
            warnings,
            error: None,
        }
    }

    fn failed(operation_id: Option<&str>, error: String) -> Self {
        Self {
            success: false,
            operation_id: operation_id.map(str::to_string),
            message: "Undo failed".to_string(),
            warnings: Vec::new(),
            error: Some(error),
        }
    }
}

/// On-disk history: a plain list, or the older `{"operations": [...]}` wrapper
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredHistory {
    List(Vec<UndoOperation>),
    Wrapped { operations: Vec<UndoOperation> },
}

impl StoredHistory {
    fn into_operations(self) -> Vec<UndoOperation> {
        match self {
            StoredHistory::List(operations) | StoredHistory::Wrapped { operations } => operations,
        }
    }
}

/// Snapshot store and reverser
#[derive(Debug)]
pub struct UndoManager {
    history_path: PathBuf,
    backup_dir: PathBuf,
    operations: Mutex<Vec<UndoOperation>>,
    clock: SharedClock,
}

impl UndoManager {
    pub fn default_history_path() -> PathBuf {
        overseer_home().join(UNDO_HISTORY_FILE_NAME)
    }

    pub fn default_backup_dir() -> PathBuf {
        overseer_home().join(BACKUP_DIR_NAME)
    }

    /// Open the history at `history_path`, storing backups under `backup_dir`
    pub fn new(history_path: PathBuf, backup_dir: PathBuf, clock: SharedClock) -> Result<Self> {
        fs::create_dir_all(&backup_dir)?;
        let operations = if history_path.exists() {
            let content = fs::read_to_string(&history_path)?;
            let operations = serde_json::from_str::<StoredHistory>(&content)?.into_operations();
            info!("Loaded {} undo operations from {:?}", operations.len(), history_path);
            operations
        } else {
            Vec::new()
        };

        Ok(Self {
            history_path,
            backup_dir,
            operations: Mutex::new(operations),
            clock,
        })
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn save_history(&self, operations: &[UndoOperation]) -> Result<()> {
        ensure_parent_dir(&self.history_path)?;
        let content = serde_json::to_string_pretty(operations)?;
        fs::write(&self.history_path, content).map_err(|e| {
            error!("Failed to save undo history to {:?}: {}", self.history_path, e);
            OverseerError::undo(format!("Failed to save undo history: {}", e))
        })
    }

    fn operation_id(operation_type: OperationType, description: &str, timestamp: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(operation_type.as_str().as_bytes());
        hasher.update(description.as_bytes());
        hasher.update(
            timestamp
                .timestamp_nanos_opt()
                .unwrap_or_else(|| timestamp.timestamp_micros())
                .to_string()
                .as_bytes(),
        );
        hasher.update(Uuid::new_v4().as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }

    fn record(&self, description: String, original_state: OriginalState, owner: &OperationOwner) -> Result<String> {
        let timestamp = self.clock.now();
        let operation_type = original_state.operation_type();

        let mut operations = self.operations.lock();
        let operation_id = Self::operation_id(operation_type, &description, timestamp);
        operations.push(UndoOperation {
            operation_id: operation_id.clone(),
            operation_type,
            timestamp,
            description,
            original_state,
            success: true,
            user_id: owner.user_id.clone(),
            session_id: owner.session_id.clone(),
            undone: false,
            undone_at: None,
        });
        if let Err(e) = self.save_history(&operations) {
            if let Some(rejected) = operations.pop() {
                if let Some(backup) = rejected.original_state.backup_path() {
                    remove_backup(backup);
                }
            }
            return Err(e);
        }

        debug!("Recorded {} undo operation {}", operation_type, operation_id);
        Ok(operation_id)
    }

    /// Free backup path for `source` of the form `<basename>_<unix>.backup`
    fn backup_target(&self, source: &Path) -> PathBuf {
        let basename = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let stamp = self.clock.now().timestamp();

        let mut candidate = self.backup_dir.join(format!("{}_{}.backup", basename, stamp));
        let mut suffix = 1;
        while candidate.exists() {
            candidate = self
                .backup_dir
                .join(format!("{}_{}_{}.backup", basename, stamp, suffix));
            suffix += 1;
        }
        candidate
    }

    /// Record a command run; commands cannot be reversed
    pub fn record_command_execution(
        &self,
        command: &str,
        working_dir: Option<&str>,
        owner: &OperationOwner,
    ) -> Result<String> {
        self.record(
            format!("Command: {}", command),
            OriginalState::Command {
                command: command.to_string(),
                working_dir: working_dir.map(str::to_string),
            },
            owner,
        )
    }

    /// Back up `path` (when it exists) before a file operation
    pub fn record_file_operation(&self, path: &Path, action: FileAction, owner: &OperationOwner) -> Result<String> {
        let existed = path.is_file();
        let backup_path = if existed {
            let target = self.backup_target(path);
            if let Err(e) = fs::copy(path, &target) {
                remove_backup(&target);
                return Err(e.into());
            }
            Some(target)
        } else {
            None
        };

        self.record(
            format!("File {}: {}", action, path.display()),
            OriginalState::File {
                path: path.to_path_buf(),
                action,
                existed,
                backup_path,
            },
            owner,
        )
    }

    /// Back up the tree at `path` (when it exists) before a directory operation
    ///
    /// A tree that contains the backup directory itself cannot be snapshotted.
    pub fn record_directory_operation(
        &self,
        path: &Path,
        action: FileAction,
        owner: &OperationOwner,
    ) -> Result<String> {
        let existed = path.is_dir();
        if existed && self.holds_backup_dir(path) {
            return Err(OverseerError::undo(format!(
                "Cannot back up {}: it contains the backup directory {}",
                path.display(),
                self.backup_dir.display()
            )));
        }
        let backup_path = if existed {
            let target = self.backup_target(path);
            if let Err(e) = copy_tree(path, &target) {
                remove_backup(&target);
                return Err(e);
            }
            Some(target)
        } else {
            None
        };

        self.record(
            format!("Directory {}: {}", action, path.display()),
            OriginalState::Directory {
                path: path.to_path_buf(),
                action,
                existed,
                backup_path,
            },
            owner,
        )
    }

    fn holds_backup_dir(&self, path: &Path) -> bool {
        let backups = fs::canonicalize(&self.backup_dir).unwrap_or_else(|_| self.backup_dir.clone());
        let tree = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        backups.starts_with(tree)
    }

    /// Remember the current mode bits of `path`
    pub fn record_permission_change(&self, path: &Path, owner: &OperationOwner) -> Result<String> {
        let original_mode = read_mode(path)?;
        self.record(
            format!("Permissions of {}", path.display()),
            OriginalState::Permission {
                path: path.to_path_buf(),
                original_mode,
            },
            owner,
        )
    }

    /// Remember the previous value of a config key
    pub fn record_config_change(
        &self,
        key: &str,
        original_value: serde_json::Value,
        config_path: Option<&Path>,
        owner: &OperationOwner,
    ) -> Result<String> {
        self.record(
            format!("Config {}", key),
            OriginalState::Config {
                key: key.to_string(),
                original_value,
                config_path: config_path.map(Path::to_path_buf),
            },
            owner,
        )
    }

    pub fn get_operation(&self, operation_id: &str) -> Option<UndoOperation> {
        self.operations
            .lock()
            .iter()
            .find(|op| op.operation_id == operation_id)
            .cloned()
    }

    /// Reverse one operation
    pub fn undo_operation(&self, operation_id: &str) -> UndoResult {
        let Some(operation) = self.get_operation(operation_id) else {
            return UndoResult::failed(Some(operation_id), format!("Unknown operation: {}", operation_id));
        };
        if operation.undone {
            return UndoResult::failed(
                Some(operation_id),
                format!("Operation {} was already undone", operation_id),
            );
        }

        let warnings = match self.reverse(&operation.original_state) {
            Ok(warnings) => warnings,
            Err(e) => {
                warn!("Undo of {} failed: {}", operation_id, e);
                return UndoResult::failed(Some(operation_id), e.to_string());
            }
        };

        let now = self.clock.now();
        let mut operations = self.operations.lock();
        if let Some(op) = operations.iter_mut().find(|op| op.operation_id == operation_id) {
            op.undone = true;
            op.undone_at = Some(now);
        }
        if let Err(e) = self.save_history(&operations) {
            return UndoResult::failed(Some(operation_id), e.to_string());
        }

        info!("Undid {} operation {}", operation.operation_type, operation_id);
        UndoResult::succeeded(
            operation_id,
            format!("Undid: {}", operation.description),
            warnings,
        )
    }

    /// Reverse the newest outstanding operation, optionally restricted to one user
    pub fn undo_last_operation(&self, user_id: Option<&str>) -> UndoResult {
        match self.list_undoable_operations(user_id, 1).into_iter().next() {
            Some(operation) => self.undo_operation(&operation.operation_id),
            None => UndoResult::failed(None, "No undoable operations".to_string()),
        }
    }

    /// Outstanding operations, newest first
    pub fn list_undoable_operations(&self, user_id: Option<&str>, limit: usize) -> Vec<UndoOperation> {
        let operations = self.operations.lock();
        operations
            .iter()
            .rev()
            .filter(|op| !op.undone)
            .filter(|op| user_id.map(|id| op.user_id.as_deref() == Some(id)).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Forget operations older than `max_age_days` and delete their backups
    pub fn cleanup_old_operations(&self, max_age_days: u32) -> Result<usize> {
        let cutoff = self.clock.now() - Duration::days(max_age_days as i64);
        let mut operations = self.operations.lock();

        let (stale, fresh): (Vec<UndoOperation>, Vec<UndoOperation>) =
            operations.iter().cloned().partition(|op| op.timestamp < cutoff);
        if stale.is_empty() {
            return Ok(0);
        }

        // history first, so a failed save leaves every backup in place
        self.save_history(&fresh)?;
        *operations = fresh;
        for operation in &stale {
            if let Some(backup) = operation.original_state.backup_path() {
                remove_backup(backup);
            }
        }

        info!("Cleaned up {} undo operations older than {} days", stale.len(), max_age_days);
        Ok(stale.len())
    }

    fn reverse(&self, state: &OriginalState) -> Result<Vec<String>> {
        match state {
            OriginalState::Command { command, .. } => {
                info!("Undo requested for command '{}'; nothing to reverse", command);
                Ok(vec![format!(
                    "Command '{}' may not be reversible; its effects were not rolled back",
                    command
                )])
            }
            OriginalState::File {
                path,
                action,
                existed,
                backup_path,
            } => match action {
                FileAction::Create if !existed => {
                    if path.exists() {
                        fs::remove_file(path)?;
                    }
                    Ok(Vec::new())
                }
                _ => {
                    let backup = require_backup(path, backup_path.as_deref())?;
                    ensure_parent_dir(path)?;
                    fs::copy(backup, path)?;
                    Ok(Vec::new())
                }
            },
            OriginalState::Directory {
                path,
                action,
                existed,
                backup_path,
            } => match action {
                FileAction::Create if !existed => {
                    if path.exists() {
                        fs::remove_dir_all(path)?;
                    }
                    Ok(Vec::new())
                }
                _ => {
                    let backup = require_backup(path, backup_path.as_deref())?;
                    if path.exists() {
                        fs::remove_dir_all(path)?;
                    }
                    copy_tree(backup, path)?;
                    Ok(Vec::new())
                }
            },
            OriginalState::Permission { path, original_mode } => {
                write_mode(path, original_mode)?;
                Ok(Vec::new())
            }
            OriginalState::Config {
                key, original_value, ..
            } => {
                info!("Undo requested for config key '{}' (previous value {})", key, original_value);
                Ok(vec![format!(
                    "Config key '{}' must be restored manually to {}",
                    key, original_value
                )])
            }
        }
    }
}

fn require_backup<'a>(path: &Path, backup_path: Option<&'a Path>) -> Result<&'a Path> {
    let backup = backup_path
        .ok_or_else(|| OverseerError::undo(format!("No backup recorded for {}", path.display())))?;
    if !backup.exists() {
        return Err(OverseerError::undo(format!(
            "Backup for {} is missing: {}",
            path.display(),
            backup.display()
        )));
    }
    Ok(backup)
}

fn remove_backup(backup: &Path) {
    let removed = if backup.is_dir() {
        fs::remove_dir_all(backup)
    } else if backup.exists() {
        fs::remove_file(backup)
    } else {
        Ok(())
    };
    if let Err(e) = removed {
        warn!("Failed to delete backup {:?}: {}", backup, e);
    }
}

/// Recursively copy `source` to `destination`
fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| OverseerError::undo(format!("Failed to walk {}: {}", source.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| OverseerError::undo(e.to_string()))?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            ensure_parent_dir(&target)?;
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn read_mode(path: &Path) -> Result<String> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode() & 0o7777;
    Ok(format!("{:o}", mode))
}

#[cfg(not(unix))]
fn read_mode(path: &Path) -> Result<String> {
    let readonly = fs::metadata(path)?.permissions().readonly();
    Ok(if readonly { "444" } else { "644" }.to_string())
}

#[cfg(unix)]
fn write_mode(path: &Path, mode: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let bits = u32::from_str_radix(mode, 8)
        .map_err(|_| OverseerError::undo(format!("Invalid recorded mode '{}'", mode)))?;
    fs::set_permissions(path, fs::Permissions::from_mode(bits))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_mode(path: &Path, mode: &str) -> Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(!mode.contains(['6', '7', '2', '3']));
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, clock: &ManualClock) -> UndoManager {
        UndoManager::new(
            dir.path().join(UNDO_HISTORY_FILE_NAME),
            dir.path().join(BACKUP_DIR_NAME),
            clock.shared(),
        )
        .unwrap()
    }

    fn owner() -> OperationOwner {
        OperationOwner::new(Some("alice"), Some("s-1"))
    }

    #[test]
    fn test_undo_file_modify_restores_content() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let file = dir.path().join("notes.txt");
        fs::write(&file, "original").unwrap();

        let id = manager.record_file_operation(&file, FileAction::Modify, &owner()).unwrap();
        fs::write(&file, "changed").unwrap();

        let result = manager.undo_operation(&id);
        assert!(result.success, "{:?}", result.error);
        assert_eq!(fs::read_to_string(&file).unwrap(), "original");
        assert!(manager.get_operation(&id).unwrap().undone);

        let again = manager.undo_operation(&id);
        assert!(!again.success);
        assert!(again.error.unwrap().contains("already undone"));
    }

    #[test]
    fn test_undo_fails_when_backup_missing() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let file = dir.path().join("data.csv");
        fs::write(&file, "a,b").unwrap();

        let id = manager.record_file_operation(&file, FileAction::Delete, &owner()).unwrap();
        let backup = manager.get_operation(&id).unwrap().original_state.backup_path().unwrap().to_path_buf();
        fs::remove_file(&backup).unwrap();
        fs::remove_file(&file).unwrap();

        let result = manager.undo_operation(&id);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("missing"));
        assert!(!manager.get_operation(&id).unwrap().undone);
    }

    #[test]
    fn test_undo_create_removes_new_file() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let file = dir.path().join("fresh.txt");

        let id = manager.record_file_operation(&file, FileAction::Create, &owner()).unwrap();
        fs::write(&file, "new").unwrap();

        assert!(manager.undo_operation(&id).success);
        assert!(!file.exists());
    }

    #[test]
    fn test_undo_directory_delete() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let project = dir.path().join("project");
        fs::create_dir_all(project.join("src")).unwrap();
        fs::write(project.join("src").join("main.rs"), "fn main() {}").unwrap();

        let id = manager
            .record_directory_operation(&project, FileAction::Delete, &owner())
            .unwrap();
        fs::remove_dir_all(&project).unwrap();

        assert!(manager.undo_operation(&id).success);
        assert_eq!(
            fs::read_to_string(project.join("src").join("main.rs")).unwrap(),
            "fn main() {}"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_undo_permission_change() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let file = dir.path().join("script.sh");
        fs::write(&file, "#!/bin/sh").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o640)).unwrap();

        let id = manager.record_permission_change(&file, &owner()).unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o777)).unwrap();

        assert!(manager.undo_operation(&id).success);
        assert_eq!(fs::metadata(&file).unwrap().permissions().mode() & 0o777, 0o640);
    }

    #[test]
    fn test_command_and_config_undo_carry_warnings() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);

        let command = manager.record_command_execution("ls -la", None, &owner()).unwrap();
        let result = manager.undo_operation(&command);
        assert!(result.success);
        assert!(result.warnings[0].contains("may not be reversible"));

        let config = manager
            .record_config_change("security_level", serde_json::json!("medium"), None, &owner())
            .unwrap();
        let result = manager.undo_operation(&config);
        assert!(result.success);
        assert!(result.warnings[0].contains("manually"));
    }

    #[test]
    fn test_history_listing_and_persistence() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();

        let first = {
            let manager = manager(&dir, &clock);
            let first = manager.record_command_execution("echo a", None, &owner()).unwrap();
            manager
                .record_command_execution("echo b", None, &OperationOwner::new(Some("bob"), None))
                .unwrap();
            manager.record_command_execution("echo a", None, &owner()).unwrap();
            first
        };

        let manager = manager(&dir, &clock);
        let all = manager.list_undoable_operations(None, 10);
        assert_eq!(all.len(), 3);
        assert_ne!(all[0].operation_id, first);
        assert_eq!(all[0].operation_id.len(), 16);
        assert_eq!(manager.list_undoable_operations(Some("bob"), 10).len(), 1);

        let last = manager.undo_last_operation(Some("alice"));
        assert!(last.success);
        assert_eq!(manager.list_undoable_operations(Some("alice"), 10).len(), 1);
        assert!(!manager.undo_operation("does-not-exist").success);
    }

    #[test]
    fn test_cleanup_deletes_old_backups() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let file = dir.path().join("old.txt");
        fs::write(&file, "old").unwrap();

        let id = manager.record_file_operation(&file, FileAction::Modify, &owner()).unwrap();
        let backup = manager.get_operation(&id).unwrap().original_state.backup_path().unwrap().to_path_buf();
        assert!(backup.exists());
        assert!(backup.file_name().unwrap().to_string_lossy().ends_with(".backup"));

        clock.advance_secs(31 * 24 * 3600);
        manager.record_command_execution("pwd", None, &owner()).unwrap();

        assert_eq!(manager.cleanup_old_operations(30).unwrap(), 1);
        assert!(!backup.exists());
        assert!(manager.get_operation(&id).is_none());
        assert_eq!(manager.list_undoable_operations(None, 10).len(), 1);
    }

    #[test]
    fn test_ids_stay_unique_after_cleanup() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);

        manager.record_command_execution("pwd", None, &owner()).unwrap();
        clock.advance_secs(31 * 24 * 3600);
        let kept = manager.record_command_execution("pwd", None, &owner()).unwrap();
        assert_eq!(manager.cleanup_old_operations(30).unwrap(), 1);

        let next = manager.record_command_execution("pwd", None, &owner()).unwrap();
        assert_ne!(kept, next);
        assert_eq!(manager.list_undoable_operations(None, 10).len(), 2);
    }

    #[test]
    fn test_history_is_a_plain_list_on_disk() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        manager.record_command_execution("echo a", None, &owner()).unwrap();

        let raw = fs::read_to_string(dir.path().join(UNDO_HISTORY_FILE_NAME)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);
        assert_eq!(value[0]["operation_type"], "command");
        assert_eq!(value[0]["user_id"], "alice");
    }

    #[test]
    fn test_wrapped_history_still_loads() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let operations = {
            let manager = manager(&dir, &clock);
            manager.record_command_execution("echo a", None, &owner()).unwrap();
            manager.list_undoable_operations(None, 10)
        };
        let wrapped = serde_json::json!({ "operations": operations });
        fs::write(dir.path().join(UNDO_HISTORY_FILE_NAME), wrapped.to_string()).unwrap();

        let manager = manager(&dir, &clock);
        assert_eq!(manager.list_undoable_operations(None, 10), operations);
    }

    #[test]
    fn test_failed_save_discards_record_and_backup() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        let file = dir.path().join("draft.txt");
        fs::write(&file, "draft").unwrap();

        // a directory where the history file should be makes every save fail
        fs::create_dir(dir.path().join(UNDO_HISTORY_FILE_NAME)).unwrap();

        assert!(manager.record_file_operation(&file, FileAction::Modify, &owner()).is_err());
        assert!(manager.list_undoable_operations(None, 10).is_empty());
        assert_eq!(fs::read_dir(manager.backup_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_tree_holding_backups_is_refused() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        let err = manager
            .record_directory_operation(dir.path(), FileAction::Delete, &owner())
            .unwrap_err();
        assert!(err.to_string().contains("backup directory"));
        assert_eq!(fs::read_dir(manager.backup_dir()).unwrap().count(), 0);
        assert!(manager.list_undoable_operations(None, 10).is_empty());
    }
}
