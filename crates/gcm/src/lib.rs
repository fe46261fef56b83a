//! AES-GCM authenticated encryption composed per NIST SP 800-38D.
//!
//! The AES block primitive comes from the RustCrypto `aes` crate; everything
//! mode-level lives here: GHASH over GF(2^128) with a scalar and a
//! byte-indexed table path, J0 derivation for 96-bit and arbitrary-length
//! nonces, the inc32 counter stream, truncated-tag compute/verify, and
//! per-key nonce hygiene (a uniqueness registry plus invocation ceilings).

mod engine;
mod error;
mod gf128;
mod ghash;

pub use engine::{AesGcm, TAG_LENGTHS};
pub use error::{GcmError, Result};
