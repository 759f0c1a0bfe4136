//! Pairwise session state and the double ratchet over it.
//!
//! A [`SessionRecord`] holds the current [`SessionState`] plus archived
//! states from earlier bootstraps. Every operation runs on a copy that the
//! manager commits only after it succeeded, so a failed decrypt never leaves
//! a half-advanced chain behind.

use std::collections::VecDeque;

use log::debug;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::crypto::{aes_gcm_decrypt, aes_gcm_encrypt, parse_public, serialize_public, KeyPair};
use crate::proto::SignalMessage;

use super::ratchet::{ChainKey, MessageKeys, RootKey};
use super::{SessionError, VERSION_BYTE};

/// Bounds applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_skipped_keys: usize,
    pub max_future_messages: u32,
    pub max_receiver_chains: usize,
    pub max_archived_states: usize,
}

impl SessionLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_skipped_keys: config.max_skipped_message_keys,
            max_future_messages: config.max_future_messages,
            max_receiver_chains: config.max_receiver_chains,
            max_archived_states: config.max_archived_sessions,
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Pre-key data the initiator repeats until the responder answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SenderChain {
    ratchet_key: KeyPair,
    chain_key: ChainKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ReceiverChain {
    ratchet_key: [u8; 32],
    chain_key: ChainKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: [u8; 32],
    keys: MessageKeys,
}

/// Message keys derived ahead of time for out-of-order delivery, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SkippedKeys {
    entries: VecDeque<SkippedKey>,
}

impl SkippedKeys {
    fn insert(&mut self, ratchet_key: [u8; 32], keys: MessageKeys, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.entries.len() >= capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(SkippedKey { ratchet_key, keys });
    }

    /// Remove and return the key for `(ratchet_key, counter)`.
    fn take(&mut self, ratchet_key: &[u8; 32], counter: u32) -> Option<MessageKeys> {
        let pos = self
            .entries
            .iter()
            .position(|e| &e.ratchet_key == ratchet_key && e.keys.counter == counter)?;
        self.entries.remove(pos).map(|e| e.keys)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One ratchet session with a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    local_identity: [u8; 32],
    remote_identity: [u8; 32],
    local_registration_id: u32,
    remote_registration_id: u32,
    root_key: RootKey,
    sender_chain: SenderChain,
    receiver_chains: VecDeque<ReceiverChain>,
    previous_counter: u32,
    skipped: SkippedKeys,
    pending_pre_key: Option<PendingPreKey>,
    /// Initiator's base key; identifies the bootstrap this state came from.
    base_key: [u8; 32],
}

impl SessionState {
    /// State of the side that consumed a pre-key bundle. The first receiver
    /// chain belongs to the responder's signed pre-key.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn initiator(
        local_identity: [u8; 32],
        remote_identity: [u8; 32],
        local_registration_id: u32,
        remote_registration_id: u32,
        root_key: RootKey,
        chain_key: ChainKey,
        their_signed_pre_key: [u8; 32],
        pending: PendingPreKey,
    ) -> Self {
        let ratchet_key = KeyPair::generate();
        let (root_key, sending) = root_key.create_chain(&their_signed_pre_key, &ratchet_key);
        let mut receiver_chains = VecDeque::new();
        receiver_chains.push_back(ReceiverChain {
            ratchet_key: their_signed_pre_key,
            chain_key,
        });
        Self {
            local_identity,
            remote_identity,
            local_registration_id,
            remote_registration_id,
            root_key,
            sender_chain: SenderChain {
                ratchet_key,
                chain_key: sending,
            },
            receiver_chains,
            previous_counter: 0,
            skipped: SkippedKeys::default(),
            base_key: pending.base_key,
            pending_pre_key: Some(pending),
        }
    }

    /// State of the side that received a pre-key message; its signed
    /// pre-key doubles as the first sending ratchet key.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn responder(
        local_identity: [u8; 32],
        remote_identity: [u8; 32],
        local_registration_id: u32,
        remote_registration_id: u32,
        root_key: RootKey,
        chain_key: ChainKey,
        signed_pre_key: KeyPair,
        base_key: [u8; 32],
    ) -> Self {
        Self {
            local_identity,
            remote_identity,
            local_registration_id,
            remote_registration_id,
            root_key,
            sender_chain: SenderChain {
                ratchet_key: signed_pre_key,
                chain_key,
            },
            receiver_chains: VecDeque::new(),
            previous_counter: 0,
            skipped: SkippedKeys::default(),
            pending_pre_key: None,
            base_key,
        }
    }

    pub fn remote_identity(&self) -> &[u8; 32] {
        &self.remote_identity
    }

    pub fn local_registration_id(&self) -> u32 {
        self.local_registration_id
    }

    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    pub fn base_key(&self) -> &[u8; 32] {
        &self.base_key
    }

    pub fn pending_pre_key(&self) -> Option<&PendingPreKey> {
        self.pending_pre_key.as_ref()
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Counter the next outgoing message will carry.
    pub fn sending_counter(&self) -> u32 {
        self.sender_chain.chain_key.index
    }

    fn associated_data(sender: &[u8; 32], receiver: &[u8; 32], header: &[u8]) -> Vec<u8> {
        let mut ad = Vec::with_capacity(66 + header.len());
        ad.extend_from_slice(&serialize_public(sender));
        ad.extend_from_slice(&serialize_public(receiver));
        ad.extend_from_slice(header);
        ad
    }

    /// Encrypt one message and step the sending chain. Returns the
    /// serialized message, version byte included.
    pub(crate) fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let keys = self.sender_chain.chain_key.message_keys();
        let mut message = SignalMessage {
            ratchet_key: Some(self.sender_chain.ratchet_key.serialized_public().to_vec()),
            counter: Some(keys.counter),
            previous_counter: Some(self.previous_counter),
            ciphertext: None,
        };
        let header = header_bytes(&message);
        let ad = Self::associated_data(&self.local_identity, &self.remote_identity, &header);
        message.ciphertext = Some(aes_gcm_encrypt(&keys.cipher_key, &keys.nonce(), plaintext, &ad)?);

        self.sender_chain.chain_key = self.sender_chain.chain_key.next();
        Ok(serialize_message(&message))
    }

    /// Decrypt a serialized message, stepping the ratchet as needed.
    pub(crate) fn decrypt(&mut self, serialized: &[u8], limits: &SessionLimits) -> Result<Vec<u8>, SessionError> {
        let message = parse_message(serialized)?;
        let their_ratchet = message
            .ratchet_key
            .as_deref()
            .and_then(parse_public)
            .ok_or_else(|| SessionError::InvalidMessage("missing ratchet key".into()))?;
        let counter = message
            .counter
            .ok_or_else(|| SessionError::InvalidMessage("missing counter".into()))?;
        let ciphertext = message
            .ciphertext
            .clone()
            .ok_or_else(|| SessionError::InvalidMessage("missing ciphertext".into()))?;

        let keys = self.message_keys_for(&their_ratchet, counter, limits)?;
        let header = header_bytes(&message);
        let ad = Self::associated_data(&self.remote_identity, &self.local_identity, &header);
        let plaintext = aes_gcm_decrypt(&keys.cipher_key, &keys.nonce(), &ciphertext, &ad)?;

        // The peer has our session now; stop wrapping outgoing messages.
        self.pending_pre_key = None;
        Ok(plaintext)
    }

    fn message_keys_for(
        &mut self,
        their_ratchet: &[u8; 32],
        counter: u32,
        limits: &SessionLimits,
    ) -> Result<MessageKeys, SessionError> {
        let position = match self.receiver_chains.iter().position(|c| &c.ratchet_key == their_ratchet) {
            Some(position) => position,
            None => self.step_ratchet(their_ratchet, limits),
        };
        let chain_key = self.receiver_chains[position].chain_key.clone();

        if chain_key.index > counter {
            return self
                .skipped
                .take(their_ratchet, counter)
                .ok_or(SessionError::DuplicateMessage { counter });
        }
        if counter - chain_key.index > limits.max_future_messages {
            return Err(SessionError::TooFarInFuture { counter });
        }

        let mut chain_key = chain_key;
        while chain_key.index < counter {
            self.skipped
                .insert(*their_ratchet, chain_key.message_keys(), limits.max_skipped_keys);
            chain_key = chain_key.next();
        }
        let keys = chain_key.message_keys();
        self.receiver_chains[position].chain_key = chain_key.next();
        Ok(keys)
    }

    /// DH ratchet step for a new remote ratchet key; returns the new chain's position.
    fn step_ratchet(&mut self, their_ratchet: &[u8; 32], limits: &SessionLimits) -> usize {
        debug!("ratchet step for new remote key {}", hex::encode(&their_ratchet[..4]));
        let (root_key, receiving) = self.root_key.create_chain(their_ratchet, &self.sender_chain.ratchet_key);
        let ratchet_key = KeyPair::generate();
        let (root_key, sending) = root_key.create_chain(their_ratchet, &ratchet_key);

        self.root_key = root_key;
        self.previous_counter = self.sender_chain.chain_key.index.saturating_sub(1);
        self.sender_chain = SenderChain {
            ratchet_key,
            chain_key: sending,
        };
        self.receiver_chains.push_back(ReceiverChain {
            ratchet_key: *their_ratchet,
            chain_key: receiving,
        });
        while self.receiver_chains.len() > limits.max_receiver_chains.max(1) {
            self.receiver_chains.pop_front();
        }
        self.receiver_chains.len() - 1
    }
}

fn header_bytes(message: &SignalMessage) -> Vec<u8> {
    let header = SignalMessage {
        ciphertext: None,
        ..message.clone()
    };
    serialize_message(&header)
}

fn serialize_message(message: &SignalMessage) -> Vec<u8> {
    let mut out = vec![VERSION_BYTE];
    out.extend_from_slice(&message.encode_to_vec());
    out
}

fn parse_message(serialized: &[u8]) -> Result<SignalMessage, SessionError> {
    let body = super::strip_version(serialized)?;
    SignalMessage::decode(body).map_err(|e| SessionError::InvalidMessage(e.to_string()))
}

/// Current session plus states archived by later bootstraps, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: VecDeque<SessionState>,
}

impl SessionRecord {
    pub fn new(state: SessionState) -> Self {
        Self {
            current: Some(state),
            previous: VecDeque::new(),
        }
    }

    pub fn current(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    pub fn archived_count(&self) -> usize {
        self.previous.len()
    }

    /// Make `state` current, archiving the old one.
    pub fn promote(&mut self, state: SessionState, max_archived: usize) {
        if let Some(old) = self.current.replace(state) {
            self.previous.push_front(old);
        }
        self.previous.truncate(max_archived);
    }

    /// Whether the current or an archived state came from `base_key`.
    pub fn has_base_key(&self, base_key: &[u8; 32]) -> bool {
        self.current
            .iter()
            .chain(self.previous.iter())
            .any(|s| &s.base_key == base_key)
    }

    /// Index 0 is the current state, 1.. are archived ones.
    pub(crate) fn states(&self) -> impl Iterator<Item = &SessionState> {
        self.current.iter().chain(self.previous.iter())
    }

    /// Replace the state at `index` (as yielded by [`states`](Self::states))
    /// and make it current.
    pub(crate) fn commit(&mut self, index: usize, state: SessionState, max_archived: usize) {
        if index == 0 {
            self.current = Some(state);
            return;
        }
        self.previous.remove(index - 1);
        self.promote(state, max_archived);
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SessionError> {
        serde_json::to_vec(self).map_err(|e| SessionError::Store(e.into()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(bytes).map_err(|e| SessionError::Store(e.into()))
    }
}
