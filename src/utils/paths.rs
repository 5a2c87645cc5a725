//! Filesystem path helpers
//!
//! Resolution of the `~/.overseer` state directory, tilde expansion, lexical
//! normalization for protected-path checks, and owner-only file writes.

use crate::error::Result;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Directory name for Overseer state under the user's home
pub const OVERSEER_DIR_NAME: &str = ".overseer";

/// Environment variable that overrides the state directory
pub const OVERSEER_HOME_ENV: &str = "OVERSEER_HOME";

/// Root directory holding config, permissions, undo history and keys
pub fn overseer_home() -> PathBuf {
    if let Ok(dir) = std::env::var(OVERSEER_HOME_ENV) {
        if !dir.trim().is_empty() {
            return expand_path(&dir);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(OVERSEER_DIR_NAME)
}

/// Expand a leading `~` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Normalize a path string for containment checks
///
/// Expands `~`, makes relative paths absolute against the current directory and resolves
/// `.` and `..` lexically. Symlinks are not followed.
pub fn normalize_path(path: &str) -> String {
    let expanded = expand_path(path.trim());
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    normalized.to_string_lossy().into_owned()
}

/// Create the parent directory of `path` if it is missing
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Write `data` to `path` readable and writable by the owner only (0600)
pub fn write_private_file(path: &Path, data: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = file.metadata()?.permissions();
        permissions.set_mode(0o600);
        file.set_permissions(permissions)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_resolves_parent_components() {
        assert_eq!(normalize_path("/home/user/../../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize_path("/usr/./local//bin"), "/usr/local/bin");
    }

    #[test]
    fn test_normalize_expands_tilde() {
        if let Some(home) = dirs::home_dir() {
            let expected = home.join(".ssh").to_string_lossy().into_owned();
            assert_eq!(normalize_path("~/.ssh"), expected);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_file_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("secret.key");
        write_private_file(&path, b"0123456789").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read(&path).unwrap(), b"0123456789");
    }
}
