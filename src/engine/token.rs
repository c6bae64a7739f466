//! Token Authority
//!
//! Issues and validates the two credential kinds used around worker launches:
//!
//! - **Launch tokens**: short-lived, single-use. The manager mints one per
//!   worker start and hands it over on the command line, so the validity
//!   window is minutes and every nonce is consumed exactly once.
//! - **Developer tokens**: longer-lived signed credentials carrying a role
//!   claim that unlocks the build/release operations. Verified statelessly
//!   against the public key, no nonce bookkeeping.
//!
//! Both are `base64url(claims-json) . base64url(ed25519-signature)`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Launch token validity window.
const LAUNCH_TOKEN_TTL_SECS: i64 = 5 * 60;
/// Developer token validity window.
const DEV_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

const SIGNING_KEY_FILE: &str = "signing.key";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token has expired")]
    Expired,
    #[error("Token signature is invalid")]
    BadSignature,
    #[error("Token has already been consumed")]
    AlreadyConsumed,
    #[error("Unknown launch subject '{0}'")]
    UnknownSubject(String),
    #[error("Key storage error: {0}")]
    KeyStore(String),
}

/// Claims carried by a single-use launch token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchClaims {
    /// Which executable may consume this token.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    /// Unique nonce, recorded as outstanding until consumed.
    pub jti: String,
}

/// Claims carried by a developer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeveloperClaims {
    pub role: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

pub struct TokenAuthority {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    known_subjects: HashSet<String>,
    /// Nonces issued and not yet consumed. Check-and-consume happens in a
    /// single critical section so two concurrent validations of the same
    /// token cannot both succeed.
    outstanding: Mutex<HashSet<String>>,
}

impl TokenAuthority {
    /// Open the authority backed by the keypair in `config_dir`, generating
    /// and persisting a fresh keypair on first use.
    pub fn open(config_dir: &Path, known_subjects: &[&str]) -> Result<Self, TokenError> {
        let signing_key = load_or_create_key(&config_dir.join(SIGNING_KEY_FILE))?;
        Ok(Self::with_key(signing_key, known_subjects))
    }

    /// In-memory authority with a throwaway keypair (used by tests).
    pub fn ephemeral(known_subjects: &[&str]) -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::with_key(signing_key, known_subjects)
    }

    fn with_key(signing_key: SigningKey, known_subjects: &[&str]) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
            known_subjects: known_subjects.iter().map(|s| s.to_string()).collect(),
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Mint a launch token for `subject` and record its nonce as outstanding.
    pub fn issue_launch_token(&self, subject: &str) -> Result<String, TokenError> {
        if !self.known_subjects.contains(subject) {
            return Err(TokenError::UnknownSubject(subject.to_string()));
        }
        Ok(self.issue_launch_with_ttl(subject, LAUNCH_TOKEN_TTL_SECS))
    }

    fn issue_launch_with_ttl(&self, subject: &str, ttl_secs: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = LaunchClaims {
            sub: subject.to_string(),
            iat: now,
            exp: now + ttl_secs,
            jti: Uuid::new_v4().to_string(),
        };

        self.outstanding
            .lock()
            .expect("nonce set poisoned")
            .insert(claims.jti.clone());
        info!(subject, jti = %claims.jti, "issued launch token");

        self.sign_claims(&claims)
    }

    /// Validate a launch token and consume its nonce.
    ///
    /// Validity requires signature correctness AND a known subject AND
    /// unexpired AND unconsumed, in that order. The consumed check and the
    /// mark happen under one lock.
    pub fn validate_launch_token(&self, token: &str) -> Result<String, TokenError> {
        let claims: LaunchClaims = self.verify_signed(token)?;

        if !self.known_subjects.contains(&claims.sub) {
            return Err(TokenError::UnknownSubject(claims.sub));
        }
        if Utc::now().timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }

        let mut outstanding = self.outstanding.lock().expect("nonce set poisoned");
        if !outstanding.remove(&claims.jti) {
            warn!(jti = %claims.jti, "replayed launch token rejected");
            return Err(TokenError::AlreadyConsumed);
        }
        drop(outstanding);

        info!(subject = %claims.sub, jti = %claims.jti, "launch token consumed");
        Ok(claims.sub)
    }

    /// Mint a developer token carrying a role claim.
    pub fn issue_developer_token(&self, role: &str) -> String {
        let now = Utc::now().timestamp();
        let claims = DeveloperClaims {
            role: role.to_string(),
            iat: now,
            exp: now + DEV_TOKEN_TTL_SECS,
            jti: Uuid::new_v4().to_string(),
        };
        info!(role, jti = %claims.jti, "issued developer token");
        self.sign_claims(&claims)
    }

    /// Stateless developer token check: signature and expiry only.
    pub fn validate_developer_token(&self, token: &str) -> Result<DeveloperClaims, TokenError> {
        let claims: DeveloperClaims = self.verify_signed(token)?;
        if Utc::now().timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Decode claims without any validation (for `dev token-info`).
    pub fn peek_developer_claims(token: &str) -> Result<DeveloperClaims, TokenError> {
        let (payload_b64, _) = token.split_once('.').ok_or(TokenError::BadSignature)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::BadSignature)?;
        serde_json::from_slice(&payload).map_err(|_| TokenError::BadSignature)
    }

    fn sign_claims<C: Serialize>(&self, claims: &C) -> String {
        // Claims structs always serialize
        let payload = serde_json::to_vec(claims).unwrap_or_default();
        let signature = self.signing_key.sign(&payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }

    /// Split, verify, and deserialize a signed token. Any structural problem
    /// is reported as a bad signature; no claim is trusted before the
    /// signature check passes.
    fn verify_signed<C: for<'de> Deserialize<'de>>(&self, token: &str) -> Result<C, TokenError> {
        let (payload_b64, sig_b64) = token.split_once('.').ok_or(TokenError::BadSignature)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::BadSignature)?;
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::BadSignature)?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|_| TokenError::BadSignature)?;

        self.verifying_key
            .verify(&payload, &signature)
            .map_err(|_| TokenError::BadSignature)?;

        serde_json::from_slice(&payload).map_err(|_| TokenError::BadSignature)
    }
}

/// Load the ed25519 seed from disk, or generate and persist a new one.
fn load_or_create_key(path: &Path) -> Result<SigningKey, TokenError> {
    if path.exists() {
        let hex_seed = std::fs::read_to_string(path)
            .map_err(|e| TokenError::KeyStore(e.to_string()))?;
        let raw = hex::decode(hex_seed.trim())
            .map_err(|e| TokenError::KeyStore(e.to_string()))?;
        let seed: [u8; 32] = raw
            .try_into()
            .map_err(|_| TokenError::KeyStore("bad signing key length".to_string()))?;
        return Ok(SigningKey::from_bytes(&seed));
    }

    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TokenError::KeyStore(e.to_string()))?;
    }
    std::fs::write(path, hex::encode(signing_key.to_bytes()))
        .map_err(|e| TokenError::KeyStore(e.to_string()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| TokenError::KeyStore(e.to_string()))?;
    }
    info!("generated new signing keypair");
    Ok(signing_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    const WORKER: &str = "forgeworker";

    #[test]
    fn test_launch_token_roundtrip() {
        let authority = TokenAuthority::ephemeral(&[WORKER]);
        let token = authority.issue_launch_token(WORKER).unwrap();
        assert_eq!(authority.validate_launch_token(&token).unwrap(), WORKER);
    }

    #[test]
    fn test_launch_token_single_use() {
        let authority = TokenAuthority::ephemeral(&[WORKER]);
        let token = authority.issue_launch_token(WORKER).unwrap();

        assert!(authority.validate_launch_token(&token).is_ok());
        assert_eq!(
            authority.validate_launch_token(&token),
            Err(TokenError::AlreadyConsumed)
        );
    }

    #[test]
    fn test_expired_launch_token_rejected_even_if_unconsumed() {
        let authority = TokenAuthority::ephemeral(&[WORKER]);
        let token = authority.issue_launch_with_ttl(WORKER, -10);
        assert_eq!(
            authority.validate_launch_token(&token),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn test_unknown_subject_rejected_at_issue_and_validate() {
        let authority = TokenAuthority::ephemeral(&[WORKER]);
        assert!(matches!(
            authority.issue_launch_token("imposter"),
            Err(TokenError::UnknownSubject(_))
        ));

        // Correctly signed, but for a subject this authority does not launch
        let token = authority.issue_launch_with_ttl("imposter", 60);
        assert!(matches!(
            authority.validate_launch_token(&token),
            Err(TokenError::UnknownSubject(_))
        ));
    }

    #[test]
    fn test_tampered_token_is_bad_signature() {
        let authority = TokenAuthority::ephemeral(&[WORKER]);
        let token = authority.issue_launch_token(WORKER).unwrap();

        let mut tampered = token.clone();
        tampered.replace_range(0..1, if token.starts_with('A') { "B" } else { "A" });
        assert_eq!(
            authority.validate_launch_token(&tampered),
            Err(TokenError::BadSignature)
        );

        assert_eq!(
            authority.validate_launch_token("not-a-token"),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_foreign_key_is_bad_signature() {
        let ours = TokenAuthority::ephemeral(&[WORKER]);
        let theirs = TokenAuthority::ephemeral(&[WORKER]);
        let token = theirs.issue_launch_token(WORKER).unwrap();
        assert_eq!(
            ours.validate_launch_token(&token),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_concurrent_validation_single_winner() {
        let authority = Arc::new(TokenAuthority::ephemeral(&[WORKER]));
        let token = authority.issue_launch_token(WORKER).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let authority = Arc::clone(&authority);
            let token = token.clone();
            handles.push(std::thread::spawn(move || {
                authority.validate_launch_token(&token).is_ok()
            }));
        }

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }

    #[test]
    fn test_developer_token_stateless_validation() {
        let authority = TokenAuthority::ephemeral(&[WORKER]);
        let token = authority.issue_developer_token("release-engineer");

        // Validating twice succeeds: no nonce bookkeeping for developer tokens
        let claims = authority.validate_developer_token(&token).unwrap();
        assert_eq!(claims.role, "release-engineer");
        assert!(authority.validate_developer_token(&token).is_ok());
    }

    #[test]
    fn test_launch_token_not_valid_as_developer_token() {
        let authority = TokenAuthority::ephemeral(&[WORKER]);
        let token = authority.issue_launch_token(WORKER).unwrap();
        assert_eq!(
            authority.validate_developer_token(&token),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_keypair_persisted_across_instances() {
        let dir = tempdir().unwrap();
        let first = TokenAuthority::open(dir.path(), &[WORKER]).unwrap();
        let token = first.issue_developer_token("ops");

        // A second authority loads the same keypair and accepts the token
        let second = TokenAuthority::open(dir.path(), &[WORKER]).unwrap();
        assert!(second.validate_developer_token(&token).is_ok());
    }
}
