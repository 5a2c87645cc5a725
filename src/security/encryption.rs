//! At-rest encryption for Overseer
//!
//! A single 256-bit master key is generated on first use and kept in an owner-only key
//! file. Sensitive config values are sealed with AES-256-GCM and stored as
//! `enc:` + base64(nonce ‖ ciphertext). Passwords are hashed with PBKDF2-HMAC-SHA256.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::config::EncryptionSettings;
use crate::error::{OverseerError, Result};
use crate::utils::{overseer_home, write_private_file, SharedClock};

/// File name of the master key inside the Overseer home
pub const ENCRYPTION_KEY_FILE_NAME: &str = "encryption.key";

/// Prefix marking an encrypted value
pub const ENCRYPTED_PREFIX: &str = "enc:";

/// PBKDF2 rounds for password hashing
pub const PBKDF2_ITERATIONS: u32 = 100_000;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const PASSWORD_HASH_SCHEME: &str = "pbkdf2_sha256";

/// Field names whose values are always encrypted
const SENSITIVE_FIELDS: &[&str] = &["password", "token", "secret", "key", "credential", "auth_token"];

type MasterKey = Secret<[u8; KEY_LEN]>;

struct KeyRing {
    current: MasterKey,
    /// Keys replaced by rotation, newest first; used for decryption only
    retired: Vec<MasterKey>,
    created_at: DateTime<Utc>,
}

/// Key and encryption state reported to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionStatus {
    pub enabled: bool,
    pub algorithm: String,
    pub key_path: PathBuf,
    pub key_present: bool,
    pub key_created_at: Option<DateTime<Utc>>,
    pub key_rotation_days: u32,
    pub rotation_due: bool,
    pub retired_keys: usize,
}

/// Config-secret encryption and password hashing
pub struct EncryptionManager {
    enabled: bool,
    algorithm: String,
    key_rotation_days: u32,
    key_path: PathBuf,
    keys: Mutex<Option<KeyRing>>,
    clock: SharedClock,
}

impl std::fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("enabled", &self.enabled)
            .field("key_path", &self.key_path)
            .field("key_loaded", &self.keys.lock().is_some())
            .finish()
    }
}

impl EncryptionManager {
    pub fn default_key_path() -> PathBuf {
        overseer_home().join(ENCRYPTION_KEY_FILE_NAME)
    }

    /// Create a manager; the key is loaded or generated on first use
    pub fn new(settings: &EncryptionSettings, key_path: PathBuf, clock: SharedClock) -> Self {
        Self {
            enabled: settings.enabled,
            algorithm: settings.algorithm.clone(),
            key_rotation_days: settings.key_rotation_days,
            key_path,
            keys: Mutex::new(None),
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }

    /// Whether values under `field` are encrypted
    pub fn is_sensitive_field(field: &str) -> bool {
        let field = field.to_lowercase();
        field.ends_with("_api_key") || SENSITIVE_FIELDS.contains(&field.as_str())
    }

    fn read_key_file(path: &Path) -> Result<MasterKey> {
        let bytes = Zeroizing::new(fs::read(path)?);
        if bytes.len() != KEY_LEN {
            return Err(OverseerError::encryption(format!(
                "Key file {:?} has {} bytes, expected {}",
                path,
                bytes.len(),
                KEY_LEN
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Secret::new(key))
    }

    fn generate_key() -> MasterKey {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Secret::new(key)
    }

    /// Backups of rotated keys next to the key file, newest first
    fn retired_key_files(&self) -> Vec<PathBuf> {
        let (Some(dir), Some(name)) = (self.key_path.parent(), self.key_path.file_name()) else {
            return Vec::new();
        };
        let prefix = format!("{}.", name.to_string_lossy());

        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| {
                        path.file_name()
                            .map(|n| {
                                let n = n.to_string_lossy();
                                n.starts_with(&prefix) && n.ends_with(".bak")
                            })
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        files.reverse();
        files
    }

    fn load_or_generate(&self) -> Result<KeyRing> {
        let (current, created_at) = if self.key_path.exists() {
            let key = Self::read_key_file(&self.key_path)?;
            let created_at = fs::metadata(&self.key_path)
                .and_then(|meta| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| self.clock.now());
            debug!("Loaded encryption key from {:?}", self.key_path);
            (key, created_at)
        } else {
            let key = Self::generate_key();
            write_private_file(&self.key_path, key.expose_secret())?;
            info!("Generated new encryption key at {:?}", self.key_path);
            (key, self.clock.now())
        };

        let mut retired = Vec::new();
        for path in self.retired_key_files() {
            match Self::read_key_file(&path) {
                Ok(key) => retired.push(key),
                Err(e) => warn!("Ignoring unreadable retired key {:?}: {}", path, e),
            }
        }

        Ok(KeyRing {
            current,
            retired,
            created_at,
        })
    }

    fn with_keys<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut KeyRing) -> Result<T>,
    {
        let mut keys = self.keys.lock();
        if keys.is_none() {
            *keys = Some(self.load_or_generate()?);
        }
        match keys.as_mut() {
            Some(ring) => f(ring),
            None => Err(OverseerError::encryption("Encryption key unavailable")),
        }
    }

    fn seal(key: &MasterKey, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(key.expose_secret())
            .map_err(|e| OverseerError::encryption(format!("Failed to create cipher: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| OverseerError::encryption(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(sealed)))
    }

    fn open(key: &MasterKey, sealed: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        let cipher = Aes256Gcm::new_from_slice(key.expose_secret()).ok()?;
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .ok()
            .map(Zeroizing::new)
    }

    /// Encrypt `plaintext`; identity when encryption is disabled
    pub fn encrypt_data(&self, plaintext: &str) -> Result<String> {
        if !self.enabled {
            return Ok(plaintext.to_string());
        }
        self.with_keys(|ring| Self::seal(&ring.current, plaintext))
    }

    /// Decrypt `value`; identity when disabled or when the value is not encrypted
    ///
    /// Retired keys are tried after the current one.
    pub fn decrypt_data(&self, value: &str) -> Result<String> {
        if !self.enabled || !Self::is_encrypted(value) {
            return Ok(value.to_string());
        }

        let sealed = BASE64
            .decode(&value[ENCRYPTED_PREFIX.len()..])
            .map_err(|e| OverseerError::encryption(format!("Invalid encrypted value: {}", e)))?;
        if sealed.len() <= NONCE_LEN {
            return Err(OverseerError::encryption("Invalid encrypted data format"));
        }

        self.with_keys(|ring| {
            let plaintext = std::iter::once(&ring.current)
                .chain(ring.retired.iter())
                .find_map(|key| Self::open(key, &sealed))
                .ok_or_else(|| OverseerError::encryption("Decryption failed with all known keys"))?;
            String::from_utf8(plaintext.to_vec())
                .map_err(|e| OverseerError::encryption(format!("Invalid UTF-8 in decrypted data: {}", e)))
        })
    }

    /// Encrypt the sensitive string fields of a JSON document
    pub fn encrypt_config_data(&self, data: &Value) -> Result<Value> {
        self.transform_sensitive(data, &|value| {
            if Self::is_encrypted(value) {
                Ok(value.to_string())
            } else {
                self.encrypt_data(value)
            }
        })
    }

    /// Decrypt the sensitive string fields of a JSON document
    pub fn decrypt_config_data(&self, data: &Value) -> Result<Value> {
        self.transform_sensitive(data, &|value| self.decrypt_data(value))
    }

    /// Decrypt and re-seal sensitive fields with the current key
    pub fn reencrypt_config_data(&self, data: &Value) -> Result<Value> {
        let plain = self.decrypt_config_data(data)?;
        self.encrypt_config_data(&plain)
    }

    fn transform_sensitive(&self, data: &Value, apply: &dyn Fn(&str) -> Result<String>) -> Result<Value> {
        match data {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (field, value) in map {
                    let transformed = match value {
                        Value::String(s) if Self::is_sensitive_field(field) => Value::String(apply(s)?),
                        Value::Object(_) | Value::Array(_) => self.transform_sensitive(value, apply)?,
                        other => other.clone(),
                    };
                    out.insert(field.clone(), transformed);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.transform_sensitive(item, apply))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    /// Hash a password as `pbkdf2_sha256$<iterations>$<salt>$<hash>`
    pub fn hash_password(password: &str) -> String {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let hash = derive(password, &salt, PBKDF2_ITERATIONS);
        format!(
            "{}${}${}${}",
            PASSWORD_HASH_SCHEME,
            PBKDF2_ITERATIONS,
            BASE64.encode(salt),
            BASE64.encode(hash.as_slice())
        )
    }

    /// Check `password` against a stored hash in constant time
    pub fn verify_password(password: &str, stored: &str) -> bool {
        let parts: Vec<&str> = stored.split('$').collect();
        let [scheme, iterations, salt, expected] = parts.as_slice() else {
            return false;
        };
        if *scheme != PASSWORD_HASH_SCHEME {
            return false;
        }
        let (Ok(iterations), Ok(salt), Ok(expected)) = (
            iterations.parse::<u32>(),
            BASE64.decode(salt),
            BASE64.decode(expected),
        ) else {
            return false;
        };
        if iterations == 0 || expected.len() != KEY_LEN {
            return false;
        }

        let actual = derive(password, &salt, iterations);
        actual
            .iter()
            .zip(expected.iter())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
    }

    /// Replace the master key; returns the backup path of the old key
    ///
    /// Values sealed with the old key stay readable through the retired key list.
    pub fn rotate_keys(&self) -> Result<PathBuf> {
        let key_name = self
            .key_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| ENCRYPTION_KEY_FILE_NAME.to_string());

        self.with_keys(|ring| {
            let now = self.clock.now();
            let mut backup = self
                .key_path
                .with_file_name(format!("{}.{}.bak", key_name, now.timestamp()));
            let mut suffix = 1;
            while backup.exists() {
                backup = self
                    .key_path
                    .with_file_name(format!("{}.{}_{}.bak", key_name, now.timestamp(), suffix));
                suffix += 1;
            }
            write_private_file(&backup, ring.current.expose_secret())?;

            let new_key = Self::generate_key();
            write_private_file(&self.key_path, new_key.expose_secret())?;

            let old = std::mem::replace(&mut ring.current, new_key);
            ring.retired.insert(0, old);
            ring.created_at = now;

            info!("Rotated encryption key; previous key saved to {:?}", backup);
            Ok(backup)
        })
    }

    /// Whether the key is older than the rotation interval
    pub fn needs_rotation(&self) -> Result<bool> {
        let rotation_days = self.key_rotation_days;
        let now = self.clock.now();
        self.with_keys(|ring| Ok(now - ring.created_at >= Duration::days(rotation_days as i64)))
    }

    pub fn status(&self) -> EncryptionStatus {
        let (key_created_at, retired_keys) = match self.keys.lock().as_ref() {
            Some(ring) => (Some(ring.created_at), ring.retired.len()),
            None => (None, self.retired_key_files().len()),
        };
        let rotation_due = key_created_at
            .map(|created| self.clock.now() - created >= Duration::days(self.key_rotation_days as i64))
            .unwrap_or(false);

        EncryptionStatus {
            enabled: self.enabled,
            algorithm: self.algorithm.clone(),
            key_path: self.key_path.clone(),
            key_present: self.key_path.exists(),
            key_created_at,
            key_rotation_days: self.key_rotation_days,
            rotation_due,
            retired_keys,
        }
    }
}

fn derive(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut *out);
    out
}
