//! GHASH: the universal hash over GF(2^128) used by GCM.
//!
//! The hash absorbs (AAD zero-padded to blocks) ‖ (ciphertext zero-padded
//! to blocks) ‖ (bit lengths as two 64-bit big-endian integers), folding
//! each 16-byte block with Y_i = (Y_{i-1} ⊕ B_i)·H. Two multiplier paths
//! exist and must agree on all inputs: the scalar Algorithm-1 loop and the
//! byte-indexed table.

use crate::gf128::{self, MulTable};

/// Loads a block, zero-padding short trailing chunks.
pub(crate) fn block(chunk: &[u8]) -> u128 {
    let mut buf = [0u8; 16];
    buf[..chunk.len()].copy_from_slice(chunk);
    u128::from_be_bytes(buf)
}

fn absorb(mut mul_h: impl FnMut(u128) -> u128, aad: &[u8], ciphertext: &[u8]) -> u128 {
    let mut y = 0u128;
    for chunk in aad.chunks(16) {
        y = mul_h(y ^ block(chunk));
    }
    for chunk in ciphertext.chunks(16) {
        y = mul_h(y ^ block(chunk));
    }
    let lengths = ((aad.len() as u128 * 8) << 64) | (ciphertext.len() as u128 * 8);
    mul_h(y ^ lengths)
}

/// GHASH via the scalar multiplier.
pub(crate) fn scalar(h: u128, aad: &[u8], ciphertext: &[u8]) -> u128 {
    absorb(|x| gf128::mul(x, h), aad, ciphertext)
}

/// GHASH via the precomputed table.
pub(crate) fn with_table(table: &MulTable, aad: &[u8], ciphertext: &[u8]) -> u128 {
    absorb(|x| table.mul_h(x), aad, ciphertext)
}
