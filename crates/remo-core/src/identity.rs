//! Ed25519 identity: the client's long-lived signing key.
//!
//! The base64-encoded public key is the stable identifier of a principal
//! everywhere in the system (authorized keys, reservations, audit log).

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::auth::build_handshake_message;
use crate::error::{RemoError, RemoResult};

/// On-disk identity record. Both fields are standard-alphabet base64;
/// `private` holds the 64-byte keypair (seed + public half).
#[derive(Serialize, Deserialize)]
struct FilePayload {
    private: String,
    public: String,
}

/// An Ed25519 key pair.
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load an identity from its JSON file.
    pub fn load(path: &Path) -> RemoResult<Self> {
        let data = std::fs::read_to_string(path)?;
        let payload: FilePayload = serde_json::from_str(&data)
            .map_err(|e| RemoError::Identity(format!("malformed identity file: {e}")))?;
        let private = STANDARD
            .decode(&payload.private)
            .map_err(|e| RemoError::Identity(format!("invalid private key encoding: {e}")))?;
        let keypair: [u8; 64] = private
            .as_slice()
            .try_into()
            .map_err(|_| RemoError::Identity("invalid identity key size".into()))?;
        let signing = SigningKey::from_keypair_bytes(&keypair)
            .map_err(|e| RemoError::Identity(format!("invalid identity key: {e}")))?;
        Ok(Self { signing })
    }

    /// Save the identity with owner-only permissions (file 0600, dir 0700).
    pub fn save(&self, path: &Path) -> RemoResult<()> {
        let payload = FilePayload {
            private: STANDARD.encode(self.signing.to_keypair_bytes()),
            public: self.public_key_base64(),
        };
        let data = serde_json::to_string_pretty(&payload)?;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
            set_mode(dir, 0o700)?;
        }
        std::fs::write(path, data)?;
        set_mode(path, 0o600)?;
        Ok(())
    }

    /// The verifying half of the key pair.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Base64 (standard alphabet) encoding of the 32-byte public key.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.signing.verifying_key().as_bytes())
    }

    /// Sign the canonical handshake bytes for `(subdomain, timestamp)`.
    pub fn sign_handshake(&self, subdomain: &str, timestamp: i64) -> Signature {
        self.signing.sign(&build_handshake_message(subdomain, timestamp))
    }

    /// Base64 encoding of the handshake signature.
    pub fn sign_handshake_base64(&self, subdomain: &str, timestamp: i64) -> String {
        STANDARD.encode(self.sign_handshake(subdomain, timestamp).to_bytes())
    }
}

/// Default identity location under the per-user config directory.
pub fn default_identity_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".remo")
        .join("identity.json")
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
