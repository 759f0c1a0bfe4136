//! Sender keys: one hash-ratchet chain per (group, sending device).
//!
//! A sender distributes its chain key and public signing key once per epoch
//! through pairwise sessions; members then follow the chain forward only.

use std::collections::VecDeque;

use prost::Message;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    aes_gcm_decrypt, aes_gcm_encrypt, hmac_sha256, parse_public, serialize_public, xeddsa, CryptoError, Hkdf, KeyPair,
};
use crate::proto::{SenderKeyDistributionMessage, SenderKeyMessage};

use super::{strip_version, SessionError, VERSION_BYTE};

/// Epochs kept per record, newest first.
const MAX_STATES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SenderChainKey {
    iteration: u32,
    seed: [u8; 32],
}

impl SenderChainKey {
    fn next(&self) -> Self {
        Self {
            iteration: self.iteration + 1,
            seed: hmac_sha256(&self.seed, &[&[0x02]]),
        }
    }

    fn message_key(&self) -> SenderMessageKey {
        let seed = hmac_sha256(&self.seed, &[&[0x01]]);
        let okm = Hkdf::derive(None, &seed, b"WhisperGroup", 48);
        let mut key = SenderMessageKey {
            iteration: self.iteration,
            iv: [0; 16],
            cipher_key: [0; 32],
        };
        key.iv.copy_from_slice(&okm[..16]);
        key.cipher_key.copy_from_slice(&okm[16..]);
        key
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SenderMessageKey {
    iteration: u32,
    iv: [u8; 16],
    cipher_key: [u8; 32],
}

impl SenderMessageKey {
    fn nonce(&self) -> &[u8] {
        &self.iv[..12]
    }
}

impl std::fmt::Debug for SenderMessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderMessageKey")
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

/// One epoch of a sender's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyState {
    key_id: u32,
    chain: SenderChainKey,
    signing_public: [u8; 32],
    /// Present only on the sending device.
    signing_private: Option<[u8; 32]>,
    skipped: VecDeque<SenderMessageKey>,
}

impl SenderKeyState {
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn iteration(&self) -> u32 {
        self.chain.iteration
    }

    fn message_key_for(&mut self, iteration: u32, max_future: u32, max_skipped: usize) -> Result<SenderMessageKey, SessionError> {
        if iteration < self.chain.iteration {
            let pos = self
                .skipped
                .iter()
                .position(|k| k.iteration == iteration)
                .ok_or(SessionError::DuplicateMessage { counter: iteration })?;
            return self
                .skipped
                .remove(pos)
                .ok_or(SessionError::DuplicateMessage { counter: iteration });
        }
        if iteration - self.chain.iteration > max_future {
            return Err(SessionError::TooFarInFuture { counter: iteration });
        }
        let mut chain = self.chain.clone();
        while chain.iteration < iteration {
            if max_skipped > 0 {
                if self.skipped.len() >= max_skipped {
                    self.skipped.pop_front();
                }
                self.skipped.push_back(chain.message_key());
            }
            chain = chain.next();
        }
        let key = chain.message_key();
        self.chain = chain.next();
        Ok(key)
    }
}

/// All known epochs of one sender in one group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    states: VecDeque<SenderKeyState>,
}

impl SenderKeyRecord {
    /// A fresh epoch owned by the local device.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let signing = KeyPair::generate();
        let mut record = Self::default();
        record.states.push_front(SenderKeyState {
            key_id: rng.gen_range(1..i32::MAX as u32),
            chain: SenderChainKey {
                iteration: 0,
                seed: rng.gen(),
            },
            signing_public: signing.public,
            signing_private: Some(signing.private),
            skipped: VecDeque::new(),
        });
        record
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn current(&self) -> Option<&SenderKeyState> {
        self.states.front()
    }

    /// Serialized distribution message for the current epoch.
    pub fn distribution_message(&self) -> Result<Vec<u8>, SessionError> {
        let state = self
            .current()
            .ok_or_else(|| SessionError::InvalidMessage("sender key record is empty".into()))?;
        let message = SenderKeyDistributionMessage {
            id: Some(state.key_id),
            iteration: Some(state.chain.iteration),
            chain_key: Some(state.chain.seed.to_vec()),
            signing_key: Some(serialize_public(&state.signing_public).to_vec()),
        };
        let mut out = vec![VERSION_BYTE];
        out.extend_from_slice(&message.encode_to_vec());
        Ok(out)
    }

    /// Install the epoch carried by a distribution message.
    pub fn process_distribution(&mut self, serialized: &[u8]) -> Result<(), SessionError> {
        let message = SenderKeyDistributionMessage::decode(strip_version(serialized)?)
            .map_err(|e| SessionError::InvalidMessage(e.to_string()))?;
        let (Some(key_id), Some(iteration), Some(seed), Some(signing)) =
            (message.id, message.iteration, message.chain_key, message.signing_key)
        else {
            return Err(SessionError::InvalidMessage("incomplete distribution message".into()));
        };
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| SessionError::InvalidMessage("chain key must be 32 bytes".into()))?;
        let signing_public =
            parse_public(&signing).ok_or_else(|| SessionError::InvalidMessage("bad signing key".into()))?;

        if self.states.iter().any(|s| s.key_id == key_id && s.signing_public == signing_public) {
            // A repeated distribution must not rewind a chain already in use.
            return Ok(());
        }
        self.states.retain(|s| s.key_id != key_id);
        self.states.push_front(SenderKeyState {
            key_id,
            chain: SenderChainKey { iteration, seed },
            signing_public,
            signing_private: None,
            skipped: VecDeque::new(),
        });
        self.states.truncate(MAX_STATES);
        Ok(())
    }

    /// Encrypt with the current epoch: version || proto || signature.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let state = self
            .states
            .front_mut()
            .ok_or_else(|| SessionError::InvalidMessage("sender key record is empty".into()))?;
        let private = state
            .signing_private
            .ok_or_else(|| SessionError::InvalidMessage("sender key belongs to another device".into()))?;

        let key = state.chain.message_key();
        let ciphertext = aes_gcm_encrypt(&key.cipher_key, key.nonce(), plaintext, &[])?;
        let message = SenderKeyMessage {
            id: Some(state.key_id),
            iteration: Some(key.iteration),
            ciphertext: Some(ciphertext),
        };
        let mut out = vec![VERSION_BYTE];
        out.extend_from_slice(&message.encode_to_vec());
        let signature = xeddsa::sign(&private, &out);
        out.extend_from_slice(&signature);

        state.chain = state.chain.next();
        Ok(out)
    }

    /// Verify and decrypt a sender-key message, stepping its chain forward.
    pub fn decrypt(&mut self, serialized: &[u8], max_future: u32, max_skipped: usize) -> Result<Vec<u8>, SessionError> {
        if serialized.len() < 1 + xeddsa::SIGNATURE_LENGTH {
            return Err(SessionError::InvalidMessage("sender key message too short".into()));
        }
        let (signed, signature) = serialized.split_at(serialized.len() - xeddsa::SIGNATURE_LENGTH);
        let message = SenderKeyMessage::decode(strip_version(signed)?)
            .map_err(|e| SessionError::InvalidMessage(e.to_string()))?;
        let (Some(key_id), Some(iteration), Some(ciphertext)) = (message.id, message.iteration, message.ciphertext)
        else {
            return Err(SessionError::InvalidMessage("incomplete sender key message".into()));
        };

        let state = self
            .states
            .iter_mut()
            .find(|s| s.key_id == key_id)
            .ok_or_else(|| SessionError::InvalidMessage(format!("unknown sender key id {key_id}")))?;
        if !xeddsa::verify(&state.signing_public, signed, signature) {
            return Err(CryptoError::InvalidSignature.into());
        }
        let key = state.message_key_for(iteration, max_future, max_skipped)?;
        Ok(aes_gcm_decrypt(&key.cipher_key, key.nonce(), &ciphertext, &[])?)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SessionError> {
        serde_json::to_vec(self).map_err(|e| SessionError::Store(e.into()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(bytes).map_err(|e| SessionError::Store(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member_of(sender: &SenderKeyRecord) -> SenderKeyRecord {
        let mut member = SenderKeyRecord::default();
        member
            .process_distribution(&sender.distribution_message().unwrap())
            .unwrap();
        member
    }

    #[test]
    fn test_group_messages_decrypt_in_any_order() {
        let mut sender = SenderKeyRecord::generate();
        let mut member = member_of(&sender);

        let a = sender.encrypt(b"a").unwrap();
        let b = sender.encrypt(b"b").unwrap();
        let c = sender.encrypt(b"c").unwrap();
        assert_eq!(member.decrypt(&c, 2000, 2000).unwrap(), b"c");
        assert_eq!(member.decrypt(&a, 2000, 2000).unwrap(), b"a");
        assert_eq!(member.decrypt(&b, 2000, 2000).unwrap(), b"b");
        assert_eq!(
            member.decrypt(&a, 2000, 2000).unwrap_err(),
            SessionError::DuplicateMessage { counter: 0 }
        );
    }

    #[test]
    fn test_late_joiner_cannot_read_history() {
        let mut sender = SenderKeyRecord::generate();
        let early = sender.encrypt(b"before").unwrap();
        let mut member = member_of(&sender);
        let late = sender.encrypt(b"after").unwrap();

        assert!(member.decrypt(&early, 2000, 2000).is_err());
        assert_eq!(member.decrypt(&late, 2000, 2000).unwrap(), b"after");
    }

    #[test]
    fn test_forged_signature_rejected() {
        let mut sender = SenderKeyRecord::generate();
        let mut member = member_of(&sender);
        let mut message = sender.encrypt(b"x").unwrap();
        let last = message.len() - 1;
        message[last] ^= 1;
        assert_eq!(
            member.decrypt(&message, 2000, 2000).unwrap_err(),
            SessionError::Crypto(CryptoError::InvalidSignature)
        );
        assert_eq!(member.current().unwrap().iteration(), 0);
    }

    #[test]
    fn test_member_cannot_encrypt_and_redistribution_keeps_chain() {
        let mut sender = SenderKeyRecord::generate();
        let distribution = sender.distribution_message().unwrap();
        let mut member = member_of(&sender);
        assert!(member.encrypt(b"x").is_err());

        let m = sender.encrypt(b"x").unwrap();
        member.decrypt(&m, 2000, 2000).unwrap();
        member.process_distribution(&distribution).unwrap();
        assert_eq!(member.current().unwrap().iteration(), 1);

        let restored = SenderKeyRecord::deserialize(&member.serialize().unwrap()).unwrap();
        assert_eq!(restored, member);
    }
}
