//! HKDF and HMAC helpers.
//!
//! Used by the handshake, the ratchet chains, sender keys and app-state key
//! expansion.

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

fn new_mac<M: Mac + hmac::digest::KeyInit>(key: &[u8]) -> M {
    // HMAC accepts keys of any length, so this never fails.
    <M as Mac>::new_from_slice(key).expect("HMAC can take key of any size")
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac: HmacSha256 = new_mac(key);
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// HMAC-SHA512 over the concatenation of `parts`.
pub fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> [u8; 64] {
    let mut mac: HmacSha512 = new_mac(key);
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// HKDF-SHA256 key derivation.
pub struct Hkdf {
    prk: [u8; 32],
}

impl Hkdf {
    /// Extract step; a missing salt is 32 zero bytes.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = salt.unwrap_or(&[0u8; 32]);
        Self {
            prk: hmac_sha256(salt, &[ikm]),
        }
    }

    /// Expand the key to the desired length with the given info.
    pub fn expand(&self, info: &[u8], length: usize) -> Vec<u8> {
        let mut output = Vec::with_capacity(length);
        let mut t: Vec<u8> = Vec::new();
        let mut counter = 1u8;

        while output.len() < length {
            t = hmac_sha256(&self.prk, &[&t, info, &[counter]]).to_vec();
            let to_copy = (length - output.len()).min(t.len());
            output.extend_from_slice(&t[..to_copy]);
            counter = counter.wrapping_add(1);
        }

        output
    }

    /// Extract and expand in one call.
    pub fn derive(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], length: usize) -> Vec<u8> {
        Self::new(salt, ikm).expand(info, length)
    }
}

/// Derive 64 bytes and split them into two 32-byte keys.
pub fn derive_key_pair(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let derived = Hkdf::derive(salt, ikm, info, 64);
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&derived[..32]);
    second.copy_from_slice(&derived[32..]);
    (first, second)
}
