//! Bundled Secret Store
//!
//! Deterministic decryption of credentials shipped inside the binary.
//!
//! The key is derived from a fixed application passphrase with PBKDF2, so the
//! same build always derives the same key. That is what allows ciphertext to
//! be checked into source and distributed with the binary: encryption happens
//! once at release-preparation time (`forgeman dev encrypt-secret`), and every
//! installation decrypts it identically.
//!
//! Lookup order for a credential: bundled constant, then the user-configured
//! encrypted secret file, then an environment variable. Each step is optional
//! and independent.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

const APP_PASSPHRASE: &[u8] = b"forgeman-v0.1.0";
const KDF_SALT: &[u8] = b"forgeman-salt-2026";
const KDF_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;

/// Name of the release channel credential.
pub const RELEASE_TOKEN: &str = "release-token";

// Bundled ciphertexts, updated with `forgeman dev encrypt-secret`.
// Layout per value: base64(nonce || aes-256-gcm ciphertext+tag).
const BUNDLED_SECRETS: &[(&str, &str)] = &[(
    RELEASE_TOKEN,
    "hqti2SiUsa+fv9AJVXlB3tb12cDeWj9Vw6zCR33lOf1JUfldM5lF1NYfcNVK8s4s0Wwm9MLUS3erjOzAgqIXWDwIEiw=",
)];

const USER_SECRETS_FILE: &str = "secrets.enc";
const USER_KEY_FILE: &str = "secrets.key";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("Secret '{0}' unavailable")]
    Unavailable(String),
}

/// Authenticated cipher over the deterministically derived application key.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Derive the application key. Expensive (fixed high iteration count), so
    /// callers hold on to the instance.
    pub fn from_app_passphrase() -> Self {
        Self::from_passphrase(APP_PASSPHRASE)
    }

    fn from_passphrase(passphrase: &[u8]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(passphrase, KDF_SALT, KDF_ITERATIONS, &mut key);
        Self::from_key(&key)
    }

    fn from_key(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt a value for embedding in the bundled constants.
    ///
    /// The nonce is random and carried in the ciphertext, so encrypting the
    /// same value twice yields different ciphertexts; decryption of any one
    /// ciphertext is fully deterministic.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        // encrypt() only fails on absurd plaintext lengths
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .unwrap_or_default();
        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&sealed);
        BASE64.encode(raw)
    }

    /// Decrypt a base64 `nonce || ciphertext` value. Authentication failure,
    /// truncation, or bad encoding all map to `None`.
    pub fn decrypt(&self, encrypted_b64: &str) -> Option<String> {
        let raw = BASE64.decode(encrypted_b64.trim()).ok()?;
        if raw.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self.cipher.decrypt(Nonce::from_slice(nonce), sealed).ok()?;
        String::from_utf8(plain).ok()
    }
}

/// Secret store with per-name caching of both successes and failures.
///
/// A name that failed to decrypt once is not retried (the KDF and a doomed
/// ciphertext do not get cheaper the second time) until `invalidate` clears
/// its state, e.g. after the bundled constants are rotated.
pub struct SecretStore {
    cipher: SecretCipher,
    config_dir: PathBuf,
    bundled: HashMap<String, String>,
    cache: HashMap<String, String>,
    failed: HashSet<String>,
}

impl SecretStore {
    pub fn new(config_dir: &Path) -> Self {
        let bundled = BUNDLED_SECRETS
            .iter()
            .map(|(name, ct)| (name.to_string(), ct.to_string()))
            .collect();
        Self::with_bundled(bundled, config_dir)
    }

    /// Construct with an explicit bundled map (for testing).
    pub fn with_bundled(bundled: HashMap<String, String>, config_dir: &Path) -> Self {
        Self {
            cipher: SecretCipher::from_app_passphrase(),
            config_dir: config_dir.to_path_buf(),
            bundled,
            cache: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    /// Decrypt a bundled secret by name.
    pub fn get(&mut self, name: &str) -> Result<String, SecretError> {
        if let Some(value) = self.cache.get(name) {
            return Ok(value.clone());
        }
        if self.failed.contains(name) {
            return Err(SecretError::Unavailable(name.to_string()));
        }

        let ciphertext = match self.bundled.get(name) {
            Some(ct) if !ct.is_empty() => ct,
            _ => {
                debug!(name, "no bundled ciphertext for secret");
                self.failed.insert(name.to_string());
                return Err(SecretError::Unavailable(name.to_string()));
            }
        };

        match self.cipher.decrypt(ciphertext) {
            Some(value) => {
                self.cache.insert(name.to_string(), value.clone());
                Ok(value)
            }
            None => {
                warn!(name, "bundled secret failed authentication");
                self.failed.insert(name.to_string());
                Err(SecretError::Unavailable(name.to_string()))
            }
        }
    }

    /// Clear cached state for a name so the next `get` re-attempts
    /// decryption (used after a secret rotation).
    pub fn invalidate(&mut self, name: &str) {
        self.cache.remove(name);
        self.failed.remove(name);
    }

    /// Resolve a credential through the full fallback chain:
    /// bundled secret, then user-configured encrypted secret, then
    /// environment variable.
    pub fn resolve(&mut self, name: &str) -> Option<String> {
        if let Ok(value) = self.get(name) {
            return Some(value);
        }
        if let Some(value) = self.user_secret(name) {
            debug!(name, "using user-configured secret");
            return Some(value);
        }
        let env_key = env_var_name(name);
        if let Ok(value) = std::env::var(&env_key) {
            if !value.is_empty() {
                debug!(name, var = %env_key, "using secret from environment");
                return Some(value);
            }
        }
        None
    }

    /// Read a secret from the user's encrypted secret file, if configured.
    fn user_secret(&self, name: &str) -> Option<String> {
        let secrets = self.load_user_secrets().ok()??;
        secrets.get(name).cloned()
    }

    /// Store a secret in the user's encrypted secret file, creating the
    /// local key on first use.
    pub fn set_user_secret(&self, name: &str, value: &str) -> std::io::Result<()> {
        let mut secrets = self.load_user_secrets()?.unwrap_or_default();
        secrets.insert(name.to_string(), value.to_string());

        let cipher = SecretCipher::from_key(&self.user_key(true)?);
        let json = serde_json::to_string(&secrets)?;
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::write(
            self.config_dir.join(USER_SECRETS_FILE),
            cipher.encrypt(&json),
        )?;
        Ok(())
    }

    fn load_user_secrets(&self) -> std::io::Result<Option<HashMap<String, String>>> {
        let path = self.config_dir.join(USER_SECRETS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let encrypted = std::fs::read_to_string(&path)?;
        let cipher = SecretCipher::from_key(&self.user_key(false)?);
        let Some(json) = cipher.decrypt(&encrypted) else {
            warn!("user secret file failed authentication, ignoring");
            return Ok(None);
        };
        Ok(serde_json::from_str(&json).ok())
    }

    /// Load the random per-user key, generating it when `create` is set.
    fn user_key(&self, create: bool) -> std::io::Result<[u8; 32]> {
        let path = self.config_dir.join(USER_KEY_FILE);
        if path.exists() {
            let hex_key = std::fs::read_to_string(&path)?;
            let raw = hex::decode(hex_key.trim())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            return raw.try_into().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad key length")
            });
        }
        if !create {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no user secret key",
            ));
        }

        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::write(&path, hex::encode(key))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(key)
    }
}

fn env_var_name(secret_name: &str) -> String {
    format!(
        "FORGEMAN_{}",
        secret_name.to_uppercase().replace('-', "_")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_with(entries: &[(&str, &str)]) -> (SecretStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let bundled = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        (SecretStore::with_bundled(bundled, dir.path()), dir)
    }

    #[test]
    fn test_decryption_is_deterministic() {
        let cipher = SecretCipher::from_app_passphrase();
        let ct = cipher.encrypt("hunter2");
        assert_eq!(cipher.decrypt(&ct).unwrap(), "hunter2");
        assert_eq!(cipher.decrypt(&ct).unwrap(), "hunter2");

        // A second cipher instance derives the identical key
        let other = SecretCipher::from_app_passphrase();
        assert_eq!(other.decrypt(&ct).unwrap(), "hunter2");
    }

    #[test]
    fn test_bundled_release_token_decrypts() {
        let dir = tempdir().unwrap();
        let mut store = SecretStore::new(dir.path());
        let token = store.get(RELEASE_TOKEN).unwrap();
        assert!(token.starts_with("ghp_"));
        // Cached read returns the identical value
        assert_eq!(store.get(RELEASE_TOKEN).unwrap(), token);
    }

    #[test]
    fn test_corrupted_ciphertext_is_unavailable_not_garbage() {
        let cipher = SecretCipher::from_app_passphrase();
        let ct = cipher.encrypt("sensitive-value");

        let mut raw = BASE64.decode(&ct).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let corrupted = BASE64.encode(raw);

        let (mut store, _dir) = store_with(&[("token", &corrupted)]);
        assert_eq!(
            store.get("token"),
            Err(SecretError::Unavailable("token".to_string()))
        );
    }

    #[test]
    fn test_failure_is_cached_until_invalidated() {
        let (mut store, _dir) = store_with(&[("broken", "not base64!!")]);
        assert!(store.get("broken").is_err());
        assert!(store.failed.contains("broken"));

        store.invalidate("broken");
        assert!(!store.failed.contains("broken"));
        // Same doomed ciphertext, fails again after re-attempting
        assert!(store.get("broken").is_err());
    }

    #[test]
    fn test_unknown_name_is_unavailable() {
        let (mut store, _dir) = store_with(&[]);
        assert!(store.get("nope").is_err());
    }

    #[test]
    fn test_user_secret_fallback() {
        let (mut store, _dir) = store_with(&[]);
        store.set_user_secret("api-key", "abc123").unwrap();
        assert_eq!(store.resolve("api-key").unwrap(), "abc123");
    }

    #[test]
    fn test_env_var_fallback() {
        let (mut store, _dir) = store_with(&[]);
        std::env::set_var("FORGEMAN_ENV_ONLY_SECRET", "from-env");
        assert_eq!(store.resolve("env-only-secret").unwrap(), "from-env");
        std::env::remove_var("FORGEMAN_ENV_ONLY_SECRET");
    }

    #[test]
    fn test_bundled_wins_over_environment() {
        let cipher = SecretCipher::from_app_passphrase();
        let ct = cipher.encrypt("bundled-value");
        let (mut store, _dir) = store_with(&[("layered", &ct)]);

        std::env::set_var("FORGEMAN_LAYERED", "env-value");
        assert_eq!(store.resolve("layered").unwrap(), "bundled-value");
        std::env::remove_var("FORGEMAN_LAYERED");
    }
}
