//! Curve25519 key pairs and pre-key records.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use super::xeddsa;

/// Type byte prepended to serialized Curve25519 public keys.
pub const DJB_TYPE: u8 = 0x05;

/// A Curve25519 key pair for Noise and Signal operations.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Public key (32 bytes)
    pub public: [u8; 32],
    /// Private key (32 bytes, clamped)
    pub private: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private);
        Self::from_private_key(private)
    }

    /// Create a key pair from an existing private key.
    pub fn from_private_key(mut private: [u8; 32]) -> Self {
        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;

        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self {
            public: *public.as_bytes(),
            private,
        }
    }

    /// Perform X25519 Diffie-Hellman key agreement.
    pub fn dh(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        let shared = secret.diffie_hellman(&PublicKey::from(*their_public));
        *shared.as_bytes()
    }

    /// XEdDSA signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        xeddsa::sign(&self.private, message)
    }

    /// Public key with the type prefix, as it appears inside signed data.
    pub fn serialized_public(&self) -> [u8; 33] {
        serialize_public(&self.public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Prefix a raw public key with its type byte.
pub fn serialize_public(public: &[u8; 32]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = DJB_TYPE;
    out[1..].copy_from_slice(public);
    out
}

/// Accept a public key with or without its type prefix.
pub fn parse_public(bytes: &[u8]) -> Option<[u8; 32]> {
    let raw = match bytes.len() {
        33 if bytes[0] == DJB_TYPE => &bytes[1..],
        32 => bytes,
        _ => return None,
    };
    let mut key = [0u8; 32];
    key.copy_from_slice(raw);
    Some(key)
}

/// A one-time pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKey {
    pub key_id: u32,
    pub key_pair: KeyPair,
}

impl PreKey {
    /// Generate a new pre-key with the given ID.
    pub fn new(key_id: u32) -> Self {
        Self {
            key_id,
            key_pair: KeyPair::generate(),
        }
    }
}

/// A medium-term pre-key signed by the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub key_id: u32,
    pub key_pair: KeyPair,
    pub signature: Vec<u8>,
}

impl SignedPreKey {
    /// Generate a signed pre-key; the signature covers the prefixed public key.
    pub fn generate(key_id: u32, identity: &KeyPair) -> Self {
        let key_pair = KeyPair::generate();
        let signature = identity.sign(&key_pair.serialized_public()).to_vec();
        Self {
            key_id,
            key_pair,
            signature,
        }
    }

    pub fn verify(&self, identity_public: &[u8; 32]) -> bool {
        xeddsa::verify(identity_public, &self.key_pair.serialized_public(), &self.signature)
    }
}
