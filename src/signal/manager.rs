//! Session manager: bootstrap, encrypt and decrypt per device address.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use prost::Message;

use crate::config::{EngineConfig, TrustMode};
use crate::crypto::{parse_public, serialize_public, xeddsa, KeyPair};
use crate::proto::PreKeySignalMessage;
use crate::store::KeyStore;
use crate::types::DeviceAddress;

use super::bundle::{PreKeyBundle, PreKeyDirectory};
use super::group::SenderKeyRecord;
use super::ratchet::derive_initial_keys;
use super::session::{PendingPreKey, SessionLimits, SessionRecord, SessionState};
use super::{strip_version, SessionError, VERSION_BYTE};

/// An encrypted pairwise message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ciphertext {
    /// Carries the bootstrap data the recipient needs to build the session.
    PreKey(Vec<u8>),
    Whisper(Vec<u8>),
}

impl Ciphertext {
    /// Value of the `type` attribute on an `enc` node.
    pub fn enc_type(&self) -> &'static str {
        match self {
            Ciphertext::PreKey(_) => "pkmsg",
            Ciphertext::Whisper(_) => "msg",
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Ciphertext::PreKey(bytes) | Ciphertext::Whisper(bytes) => bytes,
        }
    }

    pub fn from_enc(enc_type: &str, bytes: Vec<u8>) -> Option<Self> {
        match enc_type {
            "pkmsg" => Some(Ciphertext::PreKey(bytes)),
            "msg" => Some(Ciphertext::Whisper(bytes)),
            _ => None,
        }
    }
}

/// Result of a group send.
#[derive(Debug, Clone)]
pub struct GroupEncryption {
    /// The `skmsg` payload for every member.
    pub ciphertext: Vec<u8>,
    /// Pairwise-encrypted distribution messages for members that lacked the
    /// current sender key.
    pub distributions: Vec<(DeviceAddress, Ciphertext)>,
}

/// Lazily created async mutexes, one per key.
pub(crate) struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }
}

/// Pairwise and group sessions over a key store.
pub struct SessionManager {
    store: Arc<dyn KeyStore>,
    directory: Arc<dyn PreKeyDirectory>,
    limits: SessionLimits,
    trust: TrustMode,
    address_locks: KeyedLocks<DeviceAddress>,
    group_locks: KeyedLocks<(String, DeviceAddress)>,
    /// Who holds the current sender key, per `(group, local sender)`.
    /// Kept in memory only; after a restart the key is sent again.
    distributed: Mutex<HashMap<(String, DeviceAddress), HashSet<DeviceAddress>>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KeyStore>, directory: Arc<dyn PreKeyDirectory>, config: &EngineConfig) -> Self {
        Self {
            store,
            directory,
            limits: SessionLimits::from_config(config),
            trust: config.identity_trust,
            address_locks: KeyedLocks::new(),
            group_locks: KeyedLocks::new(),
            distributed: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    pub fn has_session(&self, address: &DeviceAddress) -> Result<bool, SessionError> {
        Ok(self.load_record(address)?.is_some_and(|r| r.current().is_some()))
    }

    /// Snapshot of the stored record, for inspection.
    pub fn load_record(&self, address: &DeviceAddress) -> Result<Option<SessionRecord>, SessionError> {
        match self.store.get_session(address)? {
            Some(bytes) => Ok(Some(SessionRecord::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_record(&self, address: &DeviceAddress, record: &SessionRecord) -> Result<(), SessionError> {
        self.store.put_session(address, &record.serialize()?)?;
        Ok(())
    }

    fn check_trust(&self, address: &DeviceAddress, identity: &[u8; 32]) -> Result<(), SessionError> {
        match self.store.get_identity(address)? {
            Some(known) if &known != identity => match self.trust {
                TrustMode::Always => {
                    warn!("identity key of {address} changed");
                    Ok(())
                }
                TrustMode::FirstUse => Err(SessionError::UntrustedIdentity(address.clone())),
            },
            _ => Ok(()),
        }
    }

    /// Start a session from `bundle`, replacing any current one.
    pub async fn process_bundle(&self, address: &DeviceAddress, bundle: &PreKeyBundle) -> Result<(), SessionError> {
        let lock = self.address_locks.get(address);
        let _guard = lock.lock().await;
        self.bootstrap(address, bundle)
    }

    fn bootstrap(&self, address: &DeviceAddress, bundle: &PreKeyBundle) -> Result<(), SessionError> {
        if !xeddsa::verify(
            &bundle.identity_key,
            &serialize_public(&bundle.signed_pre_key),
            &bundle.signed_pre_key_signature,
        ) {
            return Err(SessionError::InvalidSignedPreKey);
        }
        self.check_trust(address, &bundle.identity_key)?;

        let identity = self.store.identity_key_pair()?;
        let base_key = KeyPair::generate();
        let mut agreements = vec![
            identity.dh(&bundle.signed_pre_key),
            base_key.dh(&bundle.identity_key),
            base_key.dh(&bundle.signed_pre_key),
        ];
        if let Some((_, pre_key)) = &bundle.pre_key {
            agreements.push(base_key.dh(pre_key));
        }
        let (root_key, chain_key) = derive_initial_keys(&agreements);

        let state = SessionState::initiator(
            identity.public,
            bundle.identity_key,
            self.store.registration_id()?,
            bundle.registration_id,
            root_key,
            chain_key,
            bundle.signed_pre_key,
            PendingPreKey {
                pre_key_id: bundle.pre_key.map(|(id, _)| id),
                signed_pre_key_id: bundle.signed_pre_key_id,
                base_key: base_key.public,
            },
        );
        let mut record = self.load_record(address)?.unwrap_or_default();
        record.promote(state, self.limits.max_archived_states);
        self.save_record(address, &record)?;
        self.store.put_identity(address, bundle.identity_key)?;
        info!("started session with {address}");
        Ok(())
    }

    /// Encrypt for `address`, fetching a bundle first when there is no session.
    pub async fn encrypt(&self, address: &DeviceAddress, plaintext: &[u8]) -> Result<Ciphertext, SessionError> {
        let lock = self.address_locks.get(address);
        let _guard = lock.lock().await;

        let mut record = match self.load_record(address)? {
            Some(record) if record.current().is_some() => record,
            _ => {
                debug!("no session with {address}, fetching pre-key bundle");
                let bundle = self.directory.fetch_bundle(address).await?;
                self.bootstrap(address, &bundle)?;
                self.load_record(address)?
                    .ok_or_else(|| SessionError::NoSession(address.clone()))?
            }
        };
        let mut state = record
            .current()
            .cloned()
            .ok_or_else(|| SessionError::NoSession(address.clone()))?;
        self.check_trust(address, state.remote_identity())?;

        let message = state.encrypt(plaintext)?;
        let ciphertext = match state.pending_pre_key() {
            Some(pending) => {
                let wrapper = PreKeySignalMessage {
                    pre_key_id: pending.pre_key_id,
                    base_key: Some(serialize_public(&pending.base_key).to_vec()),
                    identity_key: Some(self.store.identity_key_pair()?.serialized_public().to_vec()),
                    message: Some(message),
                    registration_id: Some(state.local_registration_id()),
                    signed_pre_key_id: Some(pending.signed_pre_key_id),
                };
                let mut out = vec![VERSION_BYTE];
                out.extend_from_slice(&wrapper.encode_to_vec());
                Ciphertext::PreKey(out)
            }
            None => Ciphertext::Whisper(message),
        };

        record.commit(0, state, self.limits.max_archived_states);
        self.save_record(address, &record)?;
        Ok(ciphertext)
    }

    /// Decrypt a message from `address`.
    pub async fn decrypt(&self, address: &DeviceAddress, ciphertext: &Ciphertext) -> Result<Vec<u8>, SessionError> {
        let lock = self.address_locks.get(address);
        let _guard = lock.lock().await;
        match ciphertext {
            Ciphertext::PreKey(bytes) => self.decrypt_pre_key(address, bytes),
            Ciphertext::Whisper(bytes) => {
                let record = self
                    .load_record(address)?
                    .ok_or_else(|| SessionError::NoSession(address.clone()))?;
                self.decrypt_with_record(address, record, bytes)
            }
        }
    }

    /// Try the current state, then archived ones; commit the one that works.
    fn decrypt_with_record(
        &self,
        address: &DeviceAddress,
        mut record: SessionRecord,
        message: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let mut first_error = None;
        let mut success = None;
        for (index, state) in record.states().enumerate() {
            let mut candidate = state.clone();
            match candidate.decrypt(message, &self.limits) {
                Ok(plaintext) => {
                    success = Some((index, candidate, plaintext));
                    break;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        let Some((index, state, plaintext)) = success else {
            return Err(first_error.unwrap_or_else(|| SessionError::NoSession(address.clone())));
        };
        if index > 0 {
            debug!("message from {address} matched archived session {index}");
        }
        record.commit(index, state, self.limits.max_archived_states);
        self.save_record(address, &record)?;
        Ok(plaintext)
    }

    fn decrypt_pre_key(&self, address: &DeviceAddress, serialized: &[u8]) -> Result<Vec<u8>, SessionError> {
        let message = PreKeySignalMessage::decode(strip_version(serialized)?)
            .map_err(|e| SessionError::InvalidMessage(e.to_string()))?;
        let base_key = message
            .base_key
            .as_deref()
            .and_then(parse_public)
            .ok_or_else(|| SessionError::InvalidMessage("missing base key".into()))?;
        let their_identity = message
            .identity_key
            .as_deref()
            .and_then(parse_public)
            .ok_or_else(|| SessionError::InvalidMessage("missing identity key".into()))?;
        let inner = message
            .message
            .as_deref()
            .ok_or_else(|| SessionError::InvalidMessage("missing inner message".into()))?;
        let signed_pre_key_id = message
            .signed_pre_key_id
            .ok_or_else(|| SessionError::InvalidMessage("missing signed pre-key id".into()))?;

        let mut record = self.load_record(address)?.unwrap_or_default();
        if record.has_base_key(&base_key) {
            // Retransmission of a bootstrap we already processed.
            return self.decrypt_with_record(address, record, inner);
        }
        self.check_trust(address, &their_identity)?;

        let signed_pre_key = self
            .store
            .get_signed_pre_key(signed_pre_key_id)?
            .ok_or(SessionError::MissingSignedPreKey(signed_pre_key_id))?;
        let pre_key = match message.pre_key_id {
            Some(id) => Some(self.store.get_pre_key(id)?.ok_or(SessionError::MissingPreKey(id))?),
            None => None,
        };
        let identity = self.store.identity_key_pair()?;

        let mut agreements = vec![
            signed_pre_key.key_pair.dh(&their_identity),
            identity.dh(&base_key),
            signed_pre_key.key_pair.dh(&base_key),
        ];
        if let Some(pre_key) = &pre_key {
            agreements.push(pre_key.key_pair.dh(&base_key));
        }
        let (root_key, chain_key) = derive_initial_keys(&agreements);
        let mut state = SessionState::responder(
            identity.public,
            their_identity,
            self.store.registration_id()?,
            message.registration_id.unwrap_or_default(),
            root_key,
            chain_key,
            signed_pre_key.key_pair,
            base_key,
        );
        let plaintext = state.decrypt(inner, &self.limits)?;

        record.promote(state, self.limits.max_archived_states);
        self.save_record(address, &record)?;
        if self.store.put_identity(address, their_identity)? {
            warn!("identity key of {address} changed");
        }
        if let Some(pre_key) = pre_key {
            self.store.remove_pre_key(pre_key.key_id)?;
        }
        info!("accepted session from {address}");
        Ok(plaintext)
    }

    fn distributed(&self) -> MutexGuard<'_, HashMap<(String, DeviceAddress), HashSet<DeviceAddress>>> {
        self.distributed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_sender_key(&self, group: &str, sender: &DeviceAddress) -> Result<Option<SenderKeyRecord>, SessionError> {
        match self.store.get_sender_key(group, sender)? {
            Some(bytes) => Ok(Some(SenderKeyRecord::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Members among `members` that have not received `local`'s current sender key.
    pub fn members_needing_distribution(
        &self,
        group: &str,
        local: &DeviceAddress,
        members: &[DeviceAddress],
    ) -> Vec<DeviceAddress> {
        let distributed = self.distributed();
        let known = distributed.get(&(group.to_string(), local.clone()));
        members
            .iter()
            .filter(|m| !known.is_some_and(|k| k.contains(*m)))
            .cloned()
            .collect()
    }

    /// Encrypt for a group as `local`, wrapping the distribution message
    /// for every member that has not seen the current epoch.
    pub async fn group_encrypt(
        &self,
        group: &str,
        local: &DeviceAddress,
        members: &[DeviceAddress],
        plaintext: &[u8],
    ) -> Result<GroupEncryption, SessionError> {
        let lock = self.group_locks.get(&(group.to_string(), local.clone()));
        let _guard = lock.lock().await;

        let mut record = match self.load_sender_key(group, local)? {
            Some(record) if !record.is_empty() => record,
            _ => {
                info!("new sender key for {group}");
                self.distributed().remove(&(group.to_string(), local.clone()));
                SenderKeyRecord::generate()
            }
        };

        let pending = self.members_needing_distribution(group, local, members);
        let mut distributions = Vec::with_capacity(pending.len());
        if !pending.is_empty() {
            let distribution = record.distribution_message()?;
            for member in &pending {
                distributions.push((member.clone(), self.encrypt(member, &distribution).await?));
            }
        }

        let ciphertext = record.encrypt(plaintext)?;
        self.store.put_sender_key(group, local, &record.serialize()?)?;
        self.distributed()
            .entry((group.to_string(), local.clone()))
            .or_default()
            .extend(pending);
        Ok(GroupEncryption {
            ciphertext,
            distributions,
        })
    }

    /// Install a sender key received from `sender`.
    pub async fn process_sender_key_distribution(
        &self,
        group: &str,
        sender: &DeviceAddress,
        distribution: &[u8],
    ) -> Result<(), SessionError> {
        let lock = self.group_locks.get(&(group.to_string(), sender.clone()));
        let _guard = lock.lock().await;
        let mut record = self.load_sender_key(group, sender)?.unwrap_or_default();
        record.process_distribution(distribution)?;
        self.store.put_sender_key(group, sender, &record.serialize()?)?;
        debug!("sender key of {sender} in {group} installed");
        Ok(())
    }

    /// Decrypt an `skmsg` from `sender` in `group`.
    pub async fn group_decrypt(&self, group: &str, sender: &DeviceAddress, message: &[u8]) -> Result<Vec<u8>, SessionError> {
        let lock = self.group_locks.get(&(group.to_string(), sender.clone()));
        let _guard = lock.lock().await;
        let mut record = self
            .load_sender_key(group, sender)?
            .filter(|r| !r.is_empty())
            .ok_or_else(|| SessionError::NoSenderKey {
                group: group.to_string(),
                sender: sender.clone(),
            })?;
        let plaintext = record.decrypt(message, self.limits.max_future_messages, self.limits.max_skipped_keys)?;
        self.store.put_sender_key(group, sender, &record.serialize()?)?;
        Ok(plaintext)
    }

    /// Start a new sender-key epoch, e.g. after a member left.
    pub async fn rotate_sender_key(&self, group: &str, local: &DeviceAddress) -> Result<(), SessionError> {
        let lock = self.group_locks.get(&(group.to_string(), local.clone()));
        let _guard = lock.lock().await;
        let record = SenderKeyRecord::generate();
        self.store.put_sender_key(group, local, &record.serialize()?)?;
        self.distributed().remove(&(group.to_string(), local.clone()));
        info!("rotated sender key for {group}");
        Ok(())
    }
}
