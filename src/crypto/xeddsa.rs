//! XEdDSA signatures over Curve25519 (Montgomery) keys.
//!
//! Identity keys are X25519 keys, yet signed pre-keys and sender-key messages
//! carry Ed25519-style signatures made with them. The Edwards sign bit of the
//! public key travels in the top bit of the signature.

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use rand::RngCore;
use sha2::{Digest, Sha512};

pub const SIGNATURE_LENGTH: usize = 64;

fn clamp(mut key: [u8; 32]) -> [u8; 32] {
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    key
}

fn scalar_from_hash(hasher: Sha512) -> Scalar {
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Sign `message` with an X25519 private key.
pub fn sign(private_key: &[u8; 32], message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
    let key_data = clamp(*private_key);
    let a = Scalar::from_bytes_mod_order(key_data);
    let ed_public = (&a * ED25519_BASEPOINT_TABLE).compress();
    let sign_bit = ed_public.as_bytes()[31] & 0x80;

    let mut random = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut random);

    let mut hasher = Sha512::new();
    hasher.update([0xFEu8]);
    hasher.update([0xFFu8; 31]);
    hasher.update(key_data);
    hasher.update(message);
    hasher.update(random);
    let r = scalar_from_hash(hasher);
    let cap_r = (&r * ED25519_BASEPOINT_TABLE).compress();

    let mut hasher = Sha512::new();
    hasher.update(cap_r.as_bytes());
    hasher.update(ed_public.as_bytes());
    hasher.update(message);
    let h = scalar_from_hash(hasher);
    let s = h * a + r;

    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature[..32].copy_from_slice(cap_r.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    signature[63] &= 0x7F;
    signature[63] |= sign_bit;
    signature
}

/// Verify an XEdDSA signature against an X25519 public key.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    if signature.len() != SIGNATURE_LENGTH {
        return false;
    }
    let sign_bit = (signature[63] & 0x80) >> 7;
    let Some(ed_point) = MontgomeryPoint(*public_key).to_edwards(sign_bit) else {
        return false;
    };
    let cap_a = ed_point.compress();

    let mut cap_r = [0u8; 32];
    cap_r.copy_from_slice(&signature[..32]);
    let mut s = [0u8; 32];
    s.copy_from_slice(&signature[32..]);
    s[31] &= 0x7F;
    if s[31] & 0xE0 != 0 {
        return false;
    }

    let mut hasher = Sha512::new();
    hasher.update(cap_r);
    hasher.update(cap_a.as_bytes());
    hasher.update(message);
    let h = scalar_from_hash(hasher);

    let check = EdwardsPoint::vartime_double_scalar_mul_basepoint(
        &h,
        &-ed_point,
        &Scalar::from_bytes_mod_order(s),
    );
    check.compress().as_bytes() == &cap_r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_sign_verify() {
        let identity = KeyPair::generate();
        let signature = sign(&identity.private, b"signed pre-key");
        assert!(verify(&identity.public, b"signed pre-key", &signature));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let identity = KeyPair::generate();
        let other = KeyPair::generate();
        let mut signature = sign(&identity.private, b"message");

        assert!(!verify(&identity.public, b"massage", &signature));
        assert!(!verify(&other.public, b"message", &signature));

        signature[5] ^= 1;
        assert!(!verify(&identity.public, b"message", &signature));
        assert!(!verify(&identity.public, b"message", &signature[..63]));
    }

    #[test]
    fn test_many_keys_verify() {
        // exercises both Edwards sign bits
        for _ in 0..16 {
            let kp = KeyPair::generate();
            let sig = sign(&kp.private, &kp.public);
            assert!(verify(&kp.public, &kp.public, &sig));
        }
    }
}
