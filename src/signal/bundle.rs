//! Pre-key bundles and the directory that hands them out.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::crypto::{PreKey, SignedPreKey};
use crate::store::{IdentityStore, PreKeyStore, StoreResult};
use crate::types::DeviceAddress;

use super::SessionError;

/// Public key material needed to start a session with a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub signed_pre_key: [u8; 32],
    pub signed_pre_key_signature: Vec<u8>,
    /// One-time pre-key `(id, public key)`, when the device had one left.
    pub pre_key: Option<(u32, [u8; 32])>,
}

impl PreKeyBundle {
    /// Bundle advertising a device's own keys, optionally with `pre_key`.
    /// The pre-key is saved so the device can consume it later.
    pub fn from_store<S>(store: &S, signed_pre_key: &SignedPreKey, pre_key: Option<&PreKey>) -> StoreResult<Self>
    where
        S: IdentityStore + PreKeyStore + ?Sized,
    {
        if let Some(pre_key) = pre_key {
            store.put_pre_key(pre_key)?;
        }
        Ok(Self {
            registration_id: store.registration_id()?,
            identity_key: store.identity_key_pair()?.public,
            signed_pre_key_id: signed_pre_key.key_id,
            signed_pre_key: signed_pre_key.key_pair.public,
            signed_pre_key_signature: signed_pre_key.signature.clone(),
            pre_key: pre_key.map(|k| (k.key_id, k.key_pair.public)),
        })
    }
}

/// Source of pre-key bundles for devices without a session.
#[async_trait]
pub trait PreKeyDirectory: Send + Sync {
    async fn fetch_bundle(&self, address: &DeviceAddress) -> Result<PreKeyBundle, SessionError>;
}

/// Directory backed by a map; a bundle's one-time pre-key is handed out once.
#[derive(Default)]
pub struct MemoryDirectory {
    bundles: Mutex<HashMap<DeviceAddress, PreKeyBundle>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, address: DeviceAddress, bundle: PreKeyBundle) {
        self.bundles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(address, bundle);
    }
}

#[async_trait]
impl PreKeyDirectory for MemoryDirectory {
    async fn fetch_bundle(&self, address: &DeviceAddress) -> Result<PreKeyBundle, SessionError> {
        let mut bundles = self
            .bundles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let bundle = bundles
            .get_mut(address)
            .ok_or_else(|| SessionError::Directory(format!("no bundle for {address}")))?;
        let handed_out = bundle.clone();
        bundle.pre_key = None;
        Ok(handed_out)
    }
}
