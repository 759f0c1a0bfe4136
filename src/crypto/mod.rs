//! Cryptographic primitives for WhatsApp protocol.
//!
//! This module provides all cryptographic operations needed for:
//! - Noise Protocol (handshake with WhatsApp servers)
//! - Signal Protocol (end-to-end encryption)
//! - App-state patch integrity

mod cipher;
mod hkdf;
mod keypair;
pub mod xeddsa;

pub use cipher::{aes_gcm_decrypt, aes_gcm_encrypt, counter_nonce, Cipher, CryptoError};
pub use hkdf::{derive_key_pair, hmac_sha256, hmac_sha512, Hkdf};
pub use keypair::{parse_public, serialize_public, KeyPair, PreKey, SignedPreKey, DJB_TYPE};
