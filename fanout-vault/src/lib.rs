//! At-rest-encrypted storage for broker credentials.
//!
//! Secrets are encrypted with an authenticated cipher keyed from process
//! configuration; plaintext only exists on the stack for the duration of a
//! single adapter call. Every fetch is audit-logged.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use fanout_core::LinkId;

mod cipher;
pub mod totp;

use cipher::StreamCipher;

/// Failures surfaced by the vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("no credentials stored for this broker link")]
    NotFound,
    #[error("stored credential token is malformed")]
    Malformed,
    #[error("credential signature mismatch")]
    Tampered,
    #[error("credential payload could not be decoded: {0}")]
    Decode(String),
}

/// Result alias for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Key/value credential bundle (api_key, password, totp_seed, ...).
///
/// Keys are kept sorted so the encrypted representation is canonical.
/// `Debug` never prints the values.
#[derive(Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Secrets(BTreeMap<String, String>);

impl Secrets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Generate the current TOTP code when a `totp_seed` entry is present.
    /// The seed itself never leaves the vault call frame.
    #[must_use]
    pub fn totp_now(&self) -> Option<String> {
        let seed = self.get("totp_seed")?;
        let now = Utc::now().timestamp().max(0) as u64;
        Some(totp::code_at(seed, now))
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

/// Encrypted credential store keyed by broker link.
pub struct CredentialVault {
    cipher: StreamCipher,
    entries: RwLock<HashMap<LinkId, String>>,
}

impl CredentialVault {
    /// Build a vault keyed from the configured secret.
    #[must_use]
    pub fn new(vault_key: &str) -> Self {
        Self {
            cipher: StreamCipher::from_secret(vault_key),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Encrypt and persist the credential bundle for a link.
    pub fn store(&self, link_id: LinkId, secrets: &Secrets) {
        let serialized =
            serde_json::to_vec(secrets).expect("string map serialization cannot fail");
        let token = self.cipher.encrypt(&serialized);
        self.entries.write().insert(link_id, token);
        info!(link_id = %link_id, "broker credentials stored");
    }

    /// Decrypt the credential bundle for a link. Audit-logged.
    pub fn fetch(&self, link_id: LinkId) -> VaultResult<Secrets> {
        let token = self
            .entries
            .read()
            .get(&link_id)
            .cloned()
            .ok_or(VaultError::NotFound)?;
        let plaintext = self.cipher.decrypt(&token).inspect_err(|err| {
            warn!(link_id = %link_id, error = %err, "credential decryption failed");
        })?;
        let secrets = serde_json::from_slice(&plaintext)
            .map_err(|err| VaultError::Decode(err.to_string()))?;
        info!(link_id = %link_id, "broker credentials fetched");
        Ok(secrets)
    }

    /// Whether credentials are stored for a link (without decrypting them).
    #[must_use]
    pub fn contains(&self, link_id: LinkId) -> bool {
        self.entries.read().contains_key(&link_id)
    }

    /// Drop the stored credentials for a link.
    pub fn forget(&self, link_id: LinkId) {
        if self.entries.write().remove(&link_id).is_some() {
            info!(link_id = %link_id, "broker credentials forgotten");
        }
    }
}
