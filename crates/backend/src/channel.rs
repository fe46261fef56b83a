//! The encrypted session channel: RSA bootstrap and the framed AES-GCM
//! transport riding on the host's byte streams.
//!
//! Wire shape, one base64 line per frame: `nonce(12) ‖ ciphertext ‖
//! tag(16)` under AES-GCM-256 with the session key and empty AAD.

use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::{rngs::OsRng, RngCore};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::info;

use crate::error::TransportError;
use gcm::AesGcm;

pub const SESSION_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Sent back through the fresh channel so the host can confirm both ends
/// derived the same key.
pub const CONFIRMATION: &[u8] = b"CHANNEL_ESTABLISHED";

/// Ephemeral RSA-2048 keypair for the session-key unwrap.
///
/// Generated at startup, public half published, private half used exactly
/// once; the whole pair is dropped after the handshake.
pub struct RsaKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl RsaKeyPair {
    pub fn generate() -> Result<Self> {
        let mut rng = OsRng;
        let private_key =
            RsaPrivateKey::new(&mut rng, 2048).context("Failed to generate RSA private key")?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// SubjectPublicKeyInfo PEM encoding of the public half.
    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .context("Failed to encode public key")
    }

    /// Host-side operation: OAEP-wrap a session key to this keypair. The
    /// sidecar itself only ever unwraps; the wrap side exists for tests.
    #[cfg(test)]
    fn wrap_session_key(&self, session_key: &[u8]) -> Result<Vec<u8>> {
        let mut rng = OsRng;
        self.public_key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), session_key)
            .context("Failed to wrap session key")
    }

    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<[u8; SESSION_KEY_LEN]> {
        let plaintext = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .context("Failed to unwrap session key")?;
        plaintext
            .as_slice()
            .try_into()
            .context("Session key must be 32 bytes")
    }
}

/// The per-process encrypted transport, bound to the session key.
pub struct SecureChannel {
    engine: AesGcm,
}

impl SecureChannel {
    pub(crate) fn new(session_key: &[u8; SESSION_KEY_LEN]) -> Result<Self> {
        let mut engine = AesGcm::new(session_key).context("Failed to build session cipher")?;
        // Outbound nonces are random 96-bit values under a key that is
        // fresh per process; no registry is kept on this channel.
        engine.set_enforce_iv_uniqueness(false);
        Ok(Self { engine })
    }

    /// Encrypts one frame: fresh random nonce, ciphertext, full tag.
    pub fn seal(&mut self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut frame = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        frame.extend_from_slice(&nonce);
        frame.extend(self.engine.encrypt(&nonce, plaintext, &[], TAG_LEN)?);
        Ok(frame)
    }

    /// Verifies and decrypts one frame.
    pub fn open(&mut self, frame: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
        if frame.len() < NONCE_LEN + TAG_LEN {
            return Err(TransportError::ShortFrame { len: frame.len() });
        }
        let (nonce, body) = frame.split_at(NONCE_LEN);
        Ok(self.engine.decrypt(nonce, body, &[], TAG_LEN)?)
    }

    /// Encrypts a frame and encodes it as one wire line (no newline).
    pub fn seal_line(&mut self, plaintext: &[u8]) -> std::result::Result<String, TransportError> {
        Ok(BASE64.encode(self.seal(plaintext)?))
    }

    /// Decodes one wire line and decrypts it.
    pub fn open_line(&mut self, line: &str) -> std::result::Result<Vec<u8>, TransportError> {
        self.open(&BASE64.decode(line.trim())?)
    }
}

/// Runs the startup handshake on the host streams.
///
/// Publishes the SPKI public key, unwraps the session key from the first
/// inbound line, and confirms the channel in-band. Failures here are fatal
/// to the process; there is no session to report them through.
pub fn establish<R: BufRead, W: Write>(reader: &mut R, writer: &mut W) -> Result<SecureChannel> {
    let keypair = RsaKeyPair::generate()?;
    establish_with_keypair(keypair, reader, writer)
}

fn establish_with_keypair<R: BufRead, W: Write>(
    keypair: RsaKeyPair,
    reader: &mut R,
    writer: &mut W,
) -> Result<SecureChannel> {
    let pem = keypair.public_key_pem()?;
    writeln!(writer, "{}", BASE64.encode(pem.as_bytes()))?;
    writer.flush()?;

    let mut line = String::new();
    reader
        .read_line(&mut line)
        .context("Failed to read wrapped session key")?;
    let line = line.trim();
    if line.is_empty() {
        bail!("No encrypted session key received");
    }
    let wrapped = BASE64
        .decode(line)
        .context("Wrapped session key is not valid base64")?;
    let session_key = keypair.unwrap_session_key(&wrapped)?;

    let mut channel = SecureChannel::new(&session_key)?;
    let confirmation = channel
        .seal_line(CONFIRMATION)
        .context("Failed to encrypt confirmation")?;
    writeln!(writer, "{confirmation}")?;
    writer.flush()?;

    info!("secure channel established");
    Ok(channel)
}
