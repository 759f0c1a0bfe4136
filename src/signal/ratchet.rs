//! Key derivation steps of the double ratchet.

use serde::{Deserialize, Serialize};

use crate::crypto::{derive_key_pair, hmac_sha256, Hkdf, KeyPair};

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

/// Symmetric chain: each step yields one message key and a new chain key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainKey {
    pub key: [u8; 32],
    pub index: u32,
}

impl ChainKey {
    pub fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    pub fn next(&self) -> Self {
        Self {
            key: hmac_sha256(&self.key, &[&[CHAIN_KEY_SEED]]),
            index: self.index + 1,
        }
    }

    pub fn message_keys(&self) -> MessageKeys {
        let seed = hmac_sha256(&self.key, &[&[MESSAGE_KEY_SEED]]);
        MessageKeys::derive(&seed, self.index)
    }
}

/// Keys protecting one message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKeys {
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub iv: [u8; 16],
    pub counter: u32,
}

impl MessageKeys {
    pub fn derive(seed: &[u8; 32], counter: u32) -> Self {
        let okm = Hkdf::derive(None, seed, b"WhisperMessageKeys", 80);
        let mut keys = Self {
            cipher_key: [0; 32],
            mac_key: [0; 32],
            iv: [0; 16],
            counter,
        };
        keys.cipher_key.copy_from_slice(&okm[..32]);
        keys.mac_key.copy_from_slice(&okm[32..64]);
        keys.iv.copy_from_slice(&okm[64..80]);
        keys
    }

    /// GCM nonce taken from the derived IV.
    pub fn nonce(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&self.iv[..12]);
        nonce
    }
}

impl std::fmt::Debug for MessageKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKeys").field("counter", &self.counter).finish_non_exhaustive()
    }
}

/// Root of the asymmetric ratchet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootKey {
    pub key: [u8; 32],
}

impl RootKey {
    /// DH ratchet step: mix `their_ratchet × ours` into a new root and chain.
    pub fn create_chain(&self, their_ratchet: &[u8; 32], ours: &KeyPair) -> (RootKey, ChainKey) {
        let secret = ours.dh(their_ratchet);
        let (root, chain) = derive_key_pair(Some(&self.key), &secret, b"WhisperRatchet");
        (RootKey { key: root }, ChainKey::new(chain, 0))
    }
}

/// Root and first chain key from the concatenated X3DH agreements.
pub fn derive_initial_keys(agreements: &[[u8; 32]]) -> (RootKey, ChainKey) {
    let mut secret = vec![0xFFu8; 32];
    for agreement in agreements {
        secret.extend_from_slice(agreement);
    }
    let (root, chain) = derive_key_pair(None, &secret, b"WhisperText");
    (RootKey { key: root }, ChainKey::new(chain, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_advances_one_way() {
        let chain = ChainKey::new([7u8; 32], 0);
        let next = chain.next();
        assert_eq!(next.index, 1);
        assert_ne!(next.key, chain.key);
        assert_eq!(chain.next(), next);
        assert_ne!(chain.message_keys().cipher_key, next.message_keys().cipher_key);
        assert_eq!(next.message_keys().counter, 1);
    }

    #[test]
    fn test_dh_step_agrees_on_both_sides() {
        let root = RootKey { key: [1u8; 32] };
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (root_a, chain_a) = root.create_chain(&bob.public, &alice);
        let (root_b, chain_b) = root.create_chain(&alice.public, &bob);
        assert_eq!(root_a, root_b);
        assert_eq!(chain_a, chain_b);
        assert_ne!(root_a.key, root.key);
    }
}
