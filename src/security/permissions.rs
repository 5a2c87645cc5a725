//! Users, permission levels and sessions
//!
//! Permission levels expand to fixed capability sets (READ_ONLY ⊂ LIMITED ⊂ STANDARD ⊂
//! ADMIN). Users are persisted to a JSON store; sessions live in memory and expire lazily
//! after a period of inactivity.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::PermissionLevel;
use crate::error::{OverseerError, Result};
use crate::utils::{ensure_parent_dir, overseer_home, SharedClock};

/// File name of the user store inside the Overseer home
pub const PERMISSIONS_FILE_NAME: &str = "permissions.json";

/// A single capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadFiles,
    WriteFiles,
    DeleteFiles,
    ExecuteCommands,
    ExecuteDangerousCommands,
    NetworkAccess,
    ViewSystemInfo,
    ViewLogs,
    AccessSystemConfig,
    ModifySystemConfig,
    AdminOperations,
    ModifySecurity,
}

impl Permission {
    pub const ALL: [Permission; 12] = [
        Permission::ReadFiles,
        Permission::WriteFiles,
        Permission::DeleteFiles,
        Permission::ExecuteCommands,
        Permission::ExecuteDangerousCommands,
        Permission::NetworkAccess,
        Permission::ViewSystemInfo,
        Permission::ViewLogs,
        Permission::AccessSystemConfig,
        Permission::ModifySystemConfig,
        Permission::AdminOperations,
        Permission::ModifySecurity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ReadFiles => "read_files",
            Permission::WriteFiles => "write_files",
            Permission::DeleteFiles => "delete_files",
            Permission::ExecuteCommands => "execute_commands",
            Permission::ExecuteDangerousCommands => "execute_dangerous_commands",
            Permission::NetworkAccess => "network_access",
            Permission::ViewSystemInfo => "view_system_info",
            Permission::ViewLogs => "view_logs",
            Permission::AccessSystemConfig => "access_system_config",
            Permission::ModifySystemConfig => "modify_system_config",
            Permission::AdminOperations => "admin_operations",
            Permission::ModifySecurity => "modify_security",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Permission::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| format!("Unknown permission: {}", s))
    }
}

/// Capability set granted by `level`
pub fn default_permissions(level: PermissionLevel) -> BTreeSet<Permission> {
    use Permission::*;

    let mut permissions: BTreeSet<Permission> = [ReadFiles, ViewSystemInfo].into_iter().collect();
    if level >= PermissionLevel::Limited {
        permissions.extend([WriteFiles, ExecuteCommands]);
    }
    if level >= PermissionLevel::Standard {
        permissions.extend([DeleteFiles, NetworkAccess, ViewLogs]);
    }
    if level >= PermissionLevel::Admin {
        permissions.extend([
            ExecuteDangerousCommands,
            AccessSystemConfig,
            ModifySystemConfig,
            AdminOperations,
            ModifySecurity,
        ]);
    }
    permissions
}

/// A user and what they may do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPermissions {
    pub user_id: String,
    pub permission_level: PermissionLevel,
    /// Explicit capability set, may diverge from the level default
    pub permissions: BTreeSet<Permission>,
    #[serde(rename = "is_active", alias = "active", default = "default_active")]
    pub active: bool,
    /// Session timeout in seconds
    #[serde(rename = "session_timeout", alias = "session_timeout_seconds")]
    pub session_timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

/// An authenticated session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Copy of the user's capabilities when the session was created
    pub permissions: BTreeSet<Permission>,
    pub timeout_seconds: u64,
    pub ip_address: Option<String>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_activity).num_seconds() > self.timeout_seconds as i64
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PermissionStore {
    users: Vec<UserPermissions>,
}

/// User and session registry
#[derive(Debug)]
pub struct PermissionManager {
    store_path: PathBuf,
    default_timeout_seconds: u64,
    users: Mutex<HashMap<String, UserPermissions>>,
    sessions: Mutex<HashMap<String, Session>>,
    clock: SharedClock,
}

impl PermissionManager {
    /// Default location of the user store
    pub fn default_path() -> PathBuf {
        overseer_home().join(PERMISSIONS_FILE_NAME)
    }

    /// Open the user store at `store_path`, creating it when missing
    pub fn new(store_path: PathBuf, default_timeout_seconds: u64, clock: SharedClock) -> Result<Self> {
        let users = Self::load_users(&store_path)?;
        let manager = Self {
            store_path,
            default_timeout_seconds,
            users: Mutex::new(users),
            sessions: Mutex::new(HashMap::new()),
            clock,
        };

        if !manager.store_path.exists() {
            let users = manager.users.lock();
            manager.save_users(&users)?;
        }
        Ok(manager)
    }

    fn load_users(path: &Path) -> Result<HashMap<String, UserPermissions>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(path)?;
        let store: PermissionStore = serde_json::from_str(&content)?;
        info!("Loaded {} users from {:?}", store.users.len(), path);
        Ok(store
            .users
            .into_iter()
            .map(|user| (user.user_id.clone(), user))
            .collect())
    }

    fn save_users(&self, users: &HashMap<String, UserPermissions>) -> Result<()> {
        let mut list: Vec<UserPermissions> = users.values().cloned().collect();
        list.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        ensure_parent_dir(&self.store_path)?;
        let content = serde_json::to_string_pretty(&PermissionStore { users: list })?;
        fs::write(&self.store_path, content)?;
        debug!("Saved {} users to {:?}", users.len(), self.store_path);
        Ok(())
    }

    /// Apply `change` to an existing user and persist
    fn modify_user<F>(&self, user_id: &str, change: F) -> Result<UserPermissions>
    where
        F: FnOnce(&mut UserPermissions),
    {
        let now = self.clock.now();
        let mut users = self.users.lock();
        let mut updated = users
            .get(user_id)
            .cloned()
            .ok_or_else(|| OverseerError::permission(format!("Unknown user: {}", user_id)))?;
        change(&mut updated);
        updated.last_modified = now;

        let previous = users.insert(user_id.to_string(), updated.clone());
        if let Err(e) = self.save_users(&users) {
            if let Some(previous) = previous {
                users.insert(user_id.to_string(), previous);
            }
            return Err(e);
        }
        Ok(updated)
    }

    /// Create a new user at `level`
    pub fn create_user(&self, user_id: &str, level: PermissionLevel) -> Result<UserPermissions> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(OverseerError::permission("User id must not be empty"));
        }

        let now = self.clock.now();
        let mut users = self.users.lock();
        if users.contains_key(user_id) {
            return Err(OverseerError::permission(format!("User already exists: {}", user_id)));
        }

        let user = UserPermissions {
            user_id: user_id.to_string(),
            permission_level: level,
            permissions: default_permissions(level),
            active: true,
            session_timeout_seconds: self.default_timeout_seconds,
            created_at: now,
            last_modified: now,
        };
        users.insert(user.user_id.clone(), user.clone());
        if let Err(e) = self.save_users(&users) {
            users.remove(user_id);
            return Err(e);
        }

        info!("Created user {} with level {}", user_id, level);
        Ok(user)
    }

    /// Return the user, creating it at `level` on first use
    pub fn ensure_user(&self, user_id: &str, level: PermissionLevel) -> Result<UserPermissions> {
        if let Some(user) = self.get_user(user_id) {
            return Ok(user);
        }
        self.create_user(user_id, level)
    }

    pub fn get_user(&self, user_id: &str) -> Option<UserPermissions> {
        self.users.lock().get(user_id).cloned()
    }

    /// All users, sorted by id
    pub fn list_users(&self) -> Vec<UserPermissions> {
        let mut users: Vec<UserPermissions> = self.users.lock().values().cloned().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Move a user to `level`, resetting explicit grants to the level default
    pub fn update_user_permission_level(&self, user_id: &str, level: PermissionLevel) -> Result<UserPermissions> {
        let user = self.modify_user(user_id, |user| {
            user.permission_level = level;
            user.permissions = default_permissions(level);
        })?;
        info!("Updated user {} to level {}", user_id, level);
        Ok(user)
    }

    /// Grant one capability; returns whether it was newly added
    pub fn grant_permission(&self, user_id: &str, permission: Permission) -> Result<bool> {
        let mut added = false;
        self.modify_user(user_id, |user| added = user.permissions.insert(permission))?;
        Ok(added)
    }

    /// Revoke one capability; returns whether it was present
    pub fn revoke_permission(&self, user_id: &str, permission: Permission) -> Result<bool> {
        let mut removed = false;
        self.modify_user(user_id, |user| removed = user.permissions.remove(&permission))?;
        Ok(removed)
    }

    /// Deactivate a user and end their sessions
    pub fn deactivate_user(&self, user_id: &str) -> Result<UserPermissions> {
        let user = self.modify_user(user_id, |user| user.active = false)?;
        let ended = self.end_user_sessions(user_id);
        info!("Deactivated user {} ({} sessions ended)", user_id, ended);
        Ok(user)
    }

    pub fn activate_user(&self, user_id: &str) -> Result<UserPermissions> {
        let user = self.modify_user(user_id, |user| user.active = true)?;
        info!("Activated user {}", user_id);
        Ok(user)
    }

    /// Remove a user and their sessions; returns whether the user existed
    pub fn delete_user(&self, user_id: &str) -> Result<bool> {
        let existed = {
            let mut users = self.users.lock();
            let Some(removed) = users.remove(user_id) else {
                return Ok(false);
            };
            if let Err(e) = self.save_users(&users) {
                users.insert(removed.user_id.clone(), removed);
                return Err(e);
            }
            true
        };

        if existed {
            self.end_user_sessions(user_id);
            info!("Deleted user {}", user_id);
        }
        Ok(existed)
    }

    /// Open a session for an existing, active user
    pub fn create_session(&self, user_id: &str, ip_address: Option<String>) -> Result<Session> {
        let user = self
            .get_user(user_id)
            .ok_or_else(|| OverseerError::session(format!("Unknown user: {}", user_id)))?;
        if !user.active {
            return Err(OverseerError::session(format!("User is deactivated: {}", user_id)));
        }

        let now = self.clock.now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            user_id: user.user_id.clone(),
            created_at: now,
            last_activity: now,
            permissions: user.permissions.clone(),
            timeout_seconds: user.session_timeout_seconds,
            ip_address,
        };
        self.sessions
            .lock()
            .insert(session.session_id.clone(), session.clone());

        info!("Created session {} for user {}", session.session_id, user_id);
        Ok(session)
    }

    /// Whether the session is live; refreshes its activity timestamp
    ///
    /// An expired session is removed on detection.
    pub fn validate_session(&self, session_id: &str) -> bool {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();

        match sessions.get_mut(session_id) {
            Some(session) if session.is_expired(now) => {
                debug!("Session {} expired", session_id);
                sessions.remove(session_id);
                false
            }
            Some(session) => {
                session.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Live session by id, without refreshing it
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        let now = self.clock.now();
        self.sessions
            .lock()
            .get(session_id)
            .filter(|session| !session.is_expired(now))
            .cloned()
    }

    /// End a session; returns whether it existed
    pub fn end_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().remove(session_id);
        if let Some(session) = &removed {
            info!("Ended session {} for user {}", session_id, session.user_id);
        }
        removed.is_some()
    }

    fn end_user_sessions(&self, user_id: &str) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| session.user_id != user_id);
        before - sessions.len()
    }

    /// Whether the session is live and holds `permission`
    pub fn check_permission(&self, session_id: &str, permission: Permission) -> bool {
        if !self.validate_session(session_id) {
            return false;
        }
        self.sessions
            .lock()
            .get(session_id)
            .map(|session| session.permissions.contains(&permission))
            .unwrap_or(false)
    }

    /// Check several capabilities at once; all false for a dead session
    pub fn check_multiple_permissions(
        &self,
        session_id: &str,
        permissions: &[Permission],
    ) -> BTreeMap<Permission, bool> {
        let granted = if self.validate_session(session_id) {
            self.sessions
                .lock()
                .get(session_id)
                .map(|session| session.permissions.clone())
                .unwrap_or_default()
        } else {
            BTreeSet::new()
        };

        permissions
            .iter()
            .map(|permission| (*permission, granted.contains(permission)))
            .collect()
    }

    /// Live sessions, optionally for one user; expired ones are dropped on the way
    pub fn list_active_sessions(&self, user_id: Option<&str>) -> Vec<Session> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, session| !session.is_expired(now));

        let mut active: Vec<Session> = sessions
            .values()
            .filter(|session| user_id.map(|id| session.user_id == id).unwrap_or(true))
            .cloned()
            .collect();
        active.sort_by_key(|session| session.created_at);
        active
    }

    /// Remove every expired session; returns how many were removed
    pub fn cleanup_expired_sessions(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));

        let removed = before - sessions.len();
        if removed > 0 {
            info!("Cleaned up {} expired sessions", removed);
        }
        removed
    }

    /// Reload users from disk, keeping the in-memory set on failure
    pub fn reload(&self) -> Result<usize> {
        match Self::load_users(&self.store_path) {
            Ok(loaded) => {
                let count = loaded.len();
                *self.users.lock() = loaded;
                Ok(count)
            }
            Err(e) => {
                warn!("Failed to reload users from {:?}: {}", self.store_path, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, clock: &ManualClock) -> PermissionManager {
        PermissionManager::new(dir.path().join(PERMISSIONS_FILE_NAME), 60, clock.shared()).unwrap()
    }

    #[test]
    fn test_level_mapping_is_nested() {
        let read_only = default_permissions(PermissionLevel::ReadOnly);
        let limited = default_permissions(PermissionLevel::Limited);
        let standard = default_permissions(PermissionLevel::Standard);
        let admin = default_permissions(PermissionLevel::Admin);

        assert!(read_only.is_subset(&limited));
        assert!(limited.is_subset(&standard));
        assert!(standard.is_subset(&admin));
        assert_eq!(admin.len(), Permission::ALL.len());
        assert!(limited.contains(&Permission::ExecuteCommands));
        assert!(!standard.contains(&Permission::ExecuteDangerousCommands));
    }

    #[test]
    fn test_permission_from_str() {
        assert_eq!("network-access".parse::<Permission>().unwrap(), Permission::NetworkAccess);
        assert!("fly".parse::<Permission>().is_err());
    }

    #[test]
    fn test_session_lifecycle_with_lazy_expiry() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);

        manager.create_user("alice", PermissionLevel::Standard).unwrap();
        let session = manager.create_session("alice", Some("127.0.0.1".to_string())).unwrap();

        assert!(manager.validate_session(&session.session_id));
        assert!(manager.check_permission(&session.session_id, Permission::NetworkAccess));
        assert!(!manager.check_permission(&session.session_id, Permission::AdminOperations));

        clock.advance_secs(59);
        assert!(manager.validate_session(&session.session_id));

        clock.advance_secs(61);
        assert!(!manager.validate_session(&session.session_id));
        assert!(manager.get_session(&session.session_id).is_none());
        assert!(!manager.check_permission(&session.session_id, Permission::ReadFiles));
    }

    #[test]
    fn test_session_requires_active_known_user() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);

        assert!(manager.create_session("ghost", None).is_err());

        manager.create_user("bob", PermissionLevel::Limited).unwrap();
        let session = manager.create_session("bob", None).unwrap();
        manager.deactivate_user("bob").unwrap();

        assert!(!manager.validate_session(&session.session_id));
        assert!(manager.create_session("bob", None).is_err());

        manager.activate_user("bob").unwrap();
        assert!(manager.create_session("bob", None).is_ok());
    }

    #[test]
    fn test_session_keeps_permission_snapshot() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);

        manager.create_user("carol", PermissionLevel::ReadOnly).unwrap();
        let session = manager.create_session("carol", None).unwrap();
        manager.grant_permission("carol", Permission::WriteFiles).unwrap();

        assert!(!manager.check_permission(&session.session_id, Permission::WriteFiles));
        let fresh = manager.create_session("carol", None).unwrap();
        assert!(manager.check_permission(&fresh.session_id, Permission::WriteFiles));
    }

    #[test]
    fn test_check_multiple_permissions() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);

        manager.create_user("dave", PermissionLevel::Limited).unwrap();
        let session = manager.create_session("dave", None).unwrap();

        let result = manager.check_multiple_permissions(
            &session.session_id,
            &[Permission::ExecuteCommands, Permission::DeleteFiles],
        );
        assert!(result[&Permission::ExecuteCommands]);
        assert!(!result[&Permission::DeleteFiles]);

        let dead = manager.check_multiple_permissions("nope", &[Permission::ReadFiles]);
        assert!(!dead[&Permission::ReadFiles]);
    }

    #[test]
    fn test_users_persist_across_instances() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();

        {
            let manager = manager(&dir, &clock);
            manager.create_user("erin", PermissionLevel::Admin).unwrap();
            manager.create_user("frank", PermissionLevel::ReadOnly).unwrap();
            manager
                .update_user_permission_level("frank", PermissionLevel::Standard)
                .unwrap();
            assert!(manager.create_user("erin", PermissionLevel::Admin).is_err());
        }

        let reopened = manager(&dir, &clock);
        let users = reopened.list_users();
        assert_eq!(users.len(), 2);
        assert_eq!(
            reopened.get_user("frank").unwrap().permission_level,
            PermissionLevel::Standard
        );

        assert!(reopened.delete_user("erin").unwrap());
        assert!(!reopened.delete_user("erin").unwrap());
        assert_eq!(reopened.reload().unwrap(), 1);
    }

    #[test]
    fn test_cleanup_and_listing() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);

        manager.ensure_user("gina", PermissionLevel::Standard).unwrap();
        manager.ensure_user("hank", PermissionLevel::Standard).unwrap();
        manager.create_session("gina", None).unwrap();
        clock.advance_secs(30);
        manager.create_session("hank", None).unwrap();

        assert_eq!(manager.list_active_sessions(None).len(), 2);
        assert_eq!(manager.list_active_sessions(Some("hank")).len(), 1);

        clock.advance_secs(45);
        assert_eq!(manager.cleanup_expired_sessions(), 1);
        assert_eq!(manager.list_active_sessions(None).len(), 1);
    }

    #[test]
    fn test_store_uses_documented_field_names() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let path = dir.path().join(PERMISSIONS_FILE_NAME);
        fs::write(
            &path,
            r#"{"users": [{
                "user_id": "ivy",
                "permission_level": "limited",
                "permissions": ["read_files", "write_files"],
                "created_at": "2026-01-05T10:00:00Z",
                "last_modified": "2026-01-05T10:00:00Z",
                "is_active": false,
                "session_timeout": 900
            }]}"#,
        )
        .unwrap();

        let manager = PermissionManager::new(path.clone(), 60, clock.shared()).unwrap();
        let ivy = manager.get_user("ivy").unwrap();
        assert!(!ivy.active);
        assert_eq!(ivy.session_timeout_seconds, 900);
        assert!(manager.create_session("ivy", None).is_err());

        manager.activate_user("ivy").unwrap();
        let saved: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let entry = &saved["users"][0];
        assert_eq!(entry["is_active"], true);
        assert_eq!(entry["session_timeout"], 900);
        assert!(entry.get("active").is_none());
    }

    #[test]
    fn test_failed_save_keeps_previous_state() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = manager(&dir, &clock);
        manager.create_user("jack", PermissionLevel::Limited).unwrap();

        // swap the store file for a directory so writes fail
        let store = dir.path().join(PERMISSIONS_FILE_NAME);
        fs::remove_file(&store).unwrap();
        fs::create_dir(&store).unwrap();

        assert!(manager
            .update_user_permission_level("jack", PermissionLevel::Admin)
            .is_err());
        assert_eq!(manager.get_user("jack").unwrap().permission_level, PermissionLevel::Limited);

        assert!(manager.create_user("kate", PermissionLevel::Standard).is_err());
        assert!(manager.get_user("kate").is_none());

        assert!(manager.delete_user("jack").is_err());
        assert!(manager.get_user("jack").is_some());
    }
}
