//! Authorization policy: which keys may claim which subdomains.
//!
//! Rules are matched per key entry:
//! - `""` or `"*"` — any subdomain
//! - `"<prefix>*"` — any subdomain starting with the prefix
//! - anything else — exact match only

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::VerifyingKey;

use crate::error::{RemoError, RemoResult};

/// Accepted clock skew around the handshake timestamp.
pub const HANDSHAKE_SKEW_SECS: i64 = 120;

/// One authorized key with its subdomain rule.
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub key: VerifyingKey,
    pub rule: String,
}

/// The set of keys permitted to open tunnels.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    entries: Vec<KeyEntry>,
}

impl AuthorizedKeys {
    pub fn new(entries: Vec<KeyEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[KeyEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load an authorized-keys file: one `<base64_public_key> [rule]` entry
    /// per line, blank lines and `#` comments ignored. A missing rule
    /// defaults to empty (permit any subdomain).
    pub fn load(path: &Path) -> RemoResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> RemoResult<Self> {
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let key_field = match fields.next() {
                Some(f) => f,
                None => continue,
            };
            let key = decode_public_key(key_field)
                .map_err(|_| RemoError::Config("invalid authorized key entry".into()))?;
            let rule = fields.next().unwrap_or("").to_string();
            entries.push(KeyEntry { key, rule });
        }
        Ok(Self { entries })
    }

    /// Whether `key` may claim `subdomain` under any of its entries.
    pub fn allow(&self, key: &VerifyingKey, subdomain: &str) -> bool {
        self.entries
            .iter()
            .filter(|entry| entry.key == *key)
            .any(|entry| rule_permits(&entry.rule, subdomain))
    }
}

/// Apply one subdomain rule.
pub fn rule_permits(rule: &str, subdomain: &str) -> bool {
    if rule.is_empty() || rule == "*" {
        return true;
    }
    if let Some(prefix) = rule.strip_suffix('*') {
        return subdomain.starts_with(prefix);
    }
    subdomain == rule
}

/// Decode a base64 public key, requiring exactly 32 bytes.
pub fn decode_public_key(encoded: &str) -> RemoResult<VerifyingKey> {
    let bytes = STANDARD.decode(encoded)?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| RemoError::Protocol("invalid public key size".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| RemoError::Protocol(format!("invalid public key: {e}")))
}

/// The canonical handshake bytes: UTF-8 of `<subdomain>|<decimal timestamp>`.
///
/// `subdomain` is the originally requested value, which is the empty string
/// when the client asks for a random allocation.
pub fn build_handshake_message(subdomain: &str, timestamp: i64) -> Vec<u8> {
    format!("{subdomain}|{timestamp}").into_bytes()
}

/// Whether a handshake timestamp is within the skew window of `now`.
/// Zero is always rejected.
pub fn fresh_timestamp(timestamp: i64) -> bool {
    if timestamp == 0 {
        return false;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    (now - timestamp).abs() <= HANDSHAKE_SKEW_SECS
}
