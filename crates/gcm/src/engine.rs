//! The GCM engine: GHASH dispatch, J0 derivation, the inc32 counter
//! stream, tag compute/verify, and per-key nonce hygiene.

use std::collections::HashSet;

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256, Block};
use subtle::ConstantTimeEq;

use crate::error::{GcmError, Result};
use crate::gf128::{self, MulTable};
use crate::ghash;

/// Tag lengths (in bytes) accepted by NIST SP 800-38D.
pub const TAG_LENGTHS: [usize; 7] = [4, 8, 12, 13, 14, 15, 16];

/// Aggregate AAD + ciphertext size below which GHASH stays on the scalar
/// multiplier. At or above it the byte-indexed table is built (once) and
/// used instead.
const TABLE_THRESHOLD: usize = 1024;

/// Per-key invocation ceiling for each nonce class; operations fail before
/// a counter can reach it.
const INVOCATION_LIMIT: u64 = 1 << 32;

/// The AES block primitive, dispatching over the three key sizes.
enum BlockCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl BlockCipher {
    fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Aes128::new_from_slice(key).map(Self::Aes128),
            24 => Aes192::new_from_slice(key).map(Self::Aes192),
            32 => Aes256::new_from_slice(key).map(Self::Aes256),
            _ => return Err(GcmError::InvalidInput("key must be 16, 24, or 32 bytes long")),
        }
        .map_err(|_| GcmError::InvalidInput("key must be 16, 24, or 32 bytes long"))
    }

    fn encrypt_block(&self, block: &mut [u8; 16]) {
        let block = Block::from_mut_slice(block.as_mut_slice());
        match self {
            Self::Aes128(c) => c.encrypt_block(block),
            Self::Aes192(c) => c.encrypt_block(block),
            Self::Aes256(c) => c.encrypt_block(block),
        }
    }
}

/// AES-GCM authenticated encryption bound to a single key.
///
/// The engine owns the hash subkey H, the lazily-built multiplication
/// table, the nonce registry, and the invocation counters. It is not safe
/// for concurrent mutation; give each worker its own engine.
pub struct AesGcm {
    cipher: BlockCipher,
    h: u128,
    table: Option<MulTable>,
    seen_nonces: HashSet<Vec<u8>>,
    enforce_iv_uniqueness: bool,
    invocations_96: u64,
    invocations_non96: u64,
}

impl AesGcm {
    /// Builds an engine over a 16-, 24-, or 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = BlockCipher::new(key)?;

        // H = E_K(0^128)
        let mut h = [0u8; 16];
        cipher.encrypt_block(&mut h);

        Ok(Self {
            cipher,
            h: u128::from_be_bytes(h),
            table: None,
            seen_nonces: HashSet::new(),
            enforce_iv_uniqueness: true,
            invocations_96: 0,
            invocations_non96: 0,
        })
    }

    /// Encrypts `plaintext`, authenticating it together with `aad`.
    ///
    /// Returns ciphertext (same length as the plaintext) with the
    /// most-significant `tag_len` bytes of the tag appended.
    pub fn encrypt(
        &mut self,
        nonce: &[u8],
        plaintext: &[u8],
        aad: &[u8],
        tag_len: usize,
    ) -> Result<Vec<u8>> {
        check_inputs(nonce, tag_len)?;

        if self.enforce_iv_uniqueness {
            if self.seen_nonces.contains(nonce) {
                return Err(GcmError::NonceReuse);
            }
            self.seen_nonces.insert(nonce.to_vec());
        }
        self.bump_invocations(nonce)?;

        let j0 = self.derive_j0(nonce);
        let mut out = plaintext.to_vec();
        self.ctr32(&j0, &mut out);

        let tag = self.compute_tag(&j0, aad, &out);
        out.extend_from_slice(&tag[..tag_len]);
        Ok(out)
    }

    /// Verifies and decrypts `data` (ciphertext ‖ truncated tag).
    ///
    /// The truncated tag is compared in constant time; on mismatch the call
    /// fails with [`GcmError::InvalidTag`] before any plaintext exists.
    pub fn decrypt(
        &mut self,
        nonce: &[u8],
        data: &[u8],
        aad: &[u8],
        tag_len: usize,
    ) -> Result<Vec<u8>> {
        check_inputs(nonce, tag_len)?;
        if data.len() < tag_len {
            return Err(GcmError::InvalidInput("data too short to contain tag"));
        }

        let (ciphertext, received_tag) = data.split_at(data.len() - tag_len);
        let j0 = self.derive_j0(nonce);

        let tag = self.compute_tag(&j0, aad, ciphertext);
        if tag[..tag_len].ct_eq(received_tag).unwrap_u8() != 1 {
            return Err(GcmError::InvalidTag);
        }

        let mut out = ciphertext.to_vec();
        self.ctr32(&j0, &mut out);
        Ok(out)
    }

    /// Controls the nonce-uniqueness guard. Intended for controlled reuse
    /// in test harnesses; leave enabled everywhere else.
    pub fn set_enforce_iv_uniqueness(&mut self, enforce: bool) {
        self.enforce_iv_uniqueness = enforce;
    }

    /// Forgets every nonce recorded for this key.
    pub fn reset_iv_registry(&mut self) {
        self.seen_nonces.clear();
    }

    fn bump_invocations(&mut self, nonce: &[u8]) -> Result<()> {
        let counter = if nonce.len() == 12 {
            &mut self.invocations_96
        } else {
            &mut self.invocations_non96
        };
        if *counter + 1 >= INVOCATION_LIMIT {
            return Err(GcmError::InvocationLimit);
        }
        *counter += 1;
        Ok(())
    }

    /// J0: the pre-counter block.
    ///
    /// A 96-bit nonce is used directly with a 0x00000001 suffix; any other
    /// length is zero-padded to a block boundary, terminated with the
    /// 64-bit bit length, and run through GHASH.
    fn derive_j0(&self, nonce: &[u8]) -> [u8; 16] {
        if nonce.len() == 12 {
            let mut j0 = [0u8; 16];
            j0[..12].copy_from_slice(nonce);
            j0[15] = 1;
            return j0;
        }

        let pad = (16 - nonce.len() % 16) % 16;
        let mut buf = Vec::with_capacity(nonce.len() + pad + 16);
        buf.extend_from_slice(nonce);
        buf.resize(buf.len() + pad + 8, 0);
        buf.extend_from_slice(&(nonce.len() as u64 * 8).to_be_bytes());

        let mut y = 0u128;
        for chunk in buf.chunks(16) {
            y = gf128::mul(y ^ ghash::block(chunk), self.h);
        }
        y.to_be_bytes()
    }

    /// Enciphers `buffer` in counter mode starting from inc32(J0).
    fn ctr32(&self, j0: &[u8; 16], buffer: &mut [u8]) {
        let mut counter = inc32(j0);
        for chunk in buffer.chunks_mut(16) {
            let mut keystream = counter;
            self.cipher.encrypt_block(&mut keystream);
            for (b, k) in chunk.iter_mut().zip(keystream.iter()) {
                *b ^= k;
            }
            counter = inc32(&counter);
        }
    }

    /// T = GHASH_H(AAD, C) ⊕ E_K(J0), full 16 bytes.
    fn compute_tag(&mut self, j0: &[u8; 16], aad: &[u8], ciphertext: &[u8]) -> [u8; 16] {
        let s = self.ghash(aad, ciphertext);
        let mut mask = *j0;
        self.cipher.encrypt_block(&mut mask);
        (s ^ u128::from_be_bytes(mask)).to_be_bytes()
    }

    fn ghash(&mut self, aad: &[u8], ciphertext: &[u8]) -> u128 {
        if aad.len() + ciphertext.len() < TABLE_THRESHOLD {
            ghash::scalar(self.h, aad, ciphertext)
        } else {
            let table = self.table.get_or_insert_with(|| MulTable::build(self.h));
            ghash::with_table(table, aad, ciphertext)
        }
    }
}

/// Copies the first 12 bytes and increments the trailing 32 bits mod 2^32.
fn inc32(block: &[u8; 16]) -> [u8; 16] {
    let mut out = *block;
    let ctr = u32::from_be_bytes([out[12], out[13], out[14], out[15]]).wrapping_add(1);
    out[12..].copy_from_slice(&ctr.to_be_bytes());
    out
}

fn check_inputs(nonce: &[u8], tag_len: usize) -> Result<()> {
    if nonce.is_empty() {
        return Err(GcmError::InvalidInput("nonce must not be empty"));
    }
    if !TAG_LENGTHS.contains(&tag_len) {
        return Err(GcmError::InvalidInput(
            "tag length must be one of {4, 8, 12, 13, 14, 15, 16}",
        ));
    }
    Ok(())
}

#[cfg(test)]
impl AesGcm {
    fn set_invocations_96(&mut self, count: u64) {
        self.invocations_96 = count;
    }
}
