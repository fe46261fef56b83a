//! The key hierarchy: a long-lived master key feeding HKDF-SHA256
//! derivation of per-container content-encryption keys and subkeys.

use std::path::Path;

use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};

/// Master key and derived-key size.
pub const KEY_LEN: usize = 32;

/// Per-container salt size.
pub const SALT_LEN: usize = 16;

/// Info string bound into every content-encryption key.
const CEK_INFO: &[u8] = b"ImAged CEK";

/// Result alias for key-hierarchy operations.
pub type Result<T> = std::result::Result<T, KeyError>;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read master key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("master key file must hold at least 32 bytes (got {got})")]
    TooShort { got: usize },

    #[error("requested length is not valid for HKDF-SHA256 output")]
    OutputLength,
}

/// The process-wide master key.
///
/// Loaded once at startup and never written back or exported; the raw bytes
/// leave this type only as HKDF input. Thread the value through explicitly
/// rather than stashing it in a global.
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Loads the master key from `path`, or generates an ephemeral one if
    /// the file is absent.
    ///
    /// Files longer than [`KEY_LEN`] are truncated to the first 32 bytes
    /// for compatibility with existing installs; the truncation is logged
    /// so the operator can see it. Shorter files are a startup error.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "master key not found; generated ephemeral key");
            return Ok(Self::generate());
        }

        let raw = std::fs::read(path)?;
        if raw.len() < KEY_LEN {
            return Err(KeyError::TooShort { got: raw.len() });
        }
        if raw.len() > KEY_LEN {
            warn!(
                path = %path.display(),
                len = raw.len(),
                "master key file longer than 32 bytes; truncating"
            );
        }

        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&raw[..KEY_LEN]);
        info!(path = %path.display(), "loaded master key");
        Ok(Self { bytes })
    }

    /// Generates a fresh in-memory master key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Builds a master key from raw bytes. Intended for tests and for
    /// callers that manage the key file themselves.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Derives the content-encryption key for a container salt.
    ///
    /// Pure in (master key, salt): identical inputs give identical keys.
    /// Salts must be fresh [`SALT_LEN`]-byte values per container.
    pub fn derive_cek(&self, salt: &[u8; SALT_LEN]) -> [u8; KEY_LEN] {
        let mut cek = [0u8; KEY_LEN];
        // 32 bytes is always a valid HKDF-SHA256 output length.
        Hkdf::<Sha256>::new(Some(salt), &self.bytes)
            .expand(CEK_INFO, &mut cek)
            .expect("fixed-length HKDF expand");
        cek
    }

    /// Derives a subkey with caller-supplied salt, info, and length.
    pub fn derive_subkey(&self, salt: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>> {
        let mut okm = vec![0u8; length];
        Hkdf::<Sha256>::new(Some(salt), &self.bytes)
            .expand(info, &mut okm)
            .map_err(|_| KeyError::OutputLength)?;
        Ok(okm)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        // Zero out sensitive material
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }
}

/// Draws a fresh container salt from the system RNG.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}
