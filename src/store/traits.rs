//! Store traits for protocol key material.
//!
//! Sessions, sender keys and app-state collection states are kept as
//! opaque serialized records; the engine owns their format.

use serde::{Deserialize, Serialize};

use crate::crypto::{KeyPair, PreKey, SignedPreKey};
use crate::types::DeviceAddress;

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("database error: {0}")]
    DatabaseError(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::SerializationError(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Local identity and the identity keys seen for remote devices.
pub trait IdentityStore: Send + Sync {
    /// The local identity key pair.
    fn identity_key_pair(&self) -> StoreResult<KeyPair>;

    fn registration_id(&self) -> StoreResult<u32>;

    /// Record `key` for `address`. Returns true when it replaced a different key.
    fn put_identity(&self, address: &DeviceAddress, key: [u8; 32]) -> StoreResult<bool>;

    fn get_identity(&self, address: &DeviceAddress) -> StoreResult<Option<[u8; 32]>>;

    fn delete_identity(&self, address: &DeviceAddress) -> StoreResult<()>;
}

/// Pairwise session records.
pub trait SessionStore: Send + Sync {
    fn get_session(&self, address: &DeviceAddress) -> StoreResult<Option<Vec<u8>>>;

    fn has_session(&self, address: &DeviceAddress) -> StoreResult<bool>;

    fn put_session(&self, address: &DeviceAddress, session: &[u8]) -> StoreResult<()>;

    fn delete_session(&self, address: &DeviceAddress) -> StoreResult<()>;
}

/// One-time pre-keys.
pub trait PreKeyStore: Send + Sync {
    fn get_pre_key(&self, id: u32) -> StoreResult<Option<PreKey>>;

    fn put_pre_key(&self, pre_key: &PreKey) -> StoreResult<()>;

    /// Remove a consumed pre-key.
    fn remove_pre_key(&self, id: u32) -> StoreResult<()>;

    fn pre_key_count(&self) -> StoreResult<usize>;
}

pub trait SignedPreKeyStore: Send + Sync {
    fn get_signed_pre_key(&self, id: u32) -> StoreResult<Option<SignedPreKey>>;

    fn put_signed_pre_key(&self, signed_pre_key: &SignedPreKey) -> StoreResult<()>;
}

/// Sender key records for group messaging, keyed by group and sending device.
pub trait SenderKeyStore: Send + Sync {
    fn get_sender_key(&self, group: &str, sender: &DeviceAddress) -> StoreResult<Option<Vec<u8>>>;

    fn put_sender_key(&self, group: &str, sender: &DeviceAddress, record: &[u8]) -> StoreResult<()>;
}

/// An app-state sync key shared by the primary device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStateSyncKey {
    pub key_data: Vec<u8>,
    /// Unix seconds when the key was issued
    pub timestamp: i64,
}

pub trait AppStateKeyStore: Send + Sync {
    fn get_app_state_key(&self, key_id: &[u8]) -> StoreResult<Option<AppStateSyncKey>>;

    fn put_app_state_key(&self, key_id: &[u8], key: AppStateSyncKey) -> StoreResult<()>;

    /// Id of the newest key, used to encrypt outgoing patches.
    fn latest_app_state_key_id(&self) -> StoreResult<Option<Vec<u8>>>;
}

/// Per-collection version, hash and value MACs.
pub trait AppStateHashStore: Send + Sync {
    fn get_collection_state(&self, name: &str) -> StoreResult<Option<Vec<u8>>>;

    fn put_collection_state(&self, name: &str, state: &[u8]) -> StoreResult<()>;

    fn delete_collection_state(&self, name: &str) -> StoreResult<()>;
}

/// Combined store interface for all stores.
pub trait KeyStore:
    IdentityStore + SessionStore + PreKeyStore + SignedPreKeyStore + SenderKeyStore + AppStateKeyStore + AppStateHashStore
{
}

// Blanket implementation for any type that implements all store traits
impl<T> KeyStore for T where
    T: IdentityStore
        + SessionStore
        + PreKeyStore
        + SignedPreKeyStore
        + SenderKeyStore
        + AppStateKeyStore
        + AppStateHashStore
{
}
