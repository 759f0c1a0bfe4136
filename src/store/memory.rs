//! In-memory store implementation for development and testing.
//!
//! For production use, back the store traits with a persistent database.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::crypto::{KeyPair, PreKey, SignedPreKey};
use crate::store::{
    AppStateHashStore, AppStateKeyStore, AppStateSyncKey, DeviceKeys, IdentityStore, PreKeyStore, SenderKeyStore,
    SessionStore, SignedPreKeyStore, StoreError, StoreResult,
};
use crate::types::DeviceAddress;

fn read<T>(lock: &RwLock<T>) -> StoreResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| StoreError::DatabaseError("lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> StoreResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| StoreError::DatabaseError("lock poisoned".to_string()))
}

/// In-memory implementation of all store traits.
pub struct MemoryStore {
    device: DeviceKeys,
    identities: RwLock<HashMap<DeviceAddress, [u8; 32]>>,
    sessions: RwLock<HashMap<DeviceAddress, Vec<u8>>>,
    pre_keys: RwLock<HashMap<u32, PreKey>>,
    signed_pre_keys: RwLock<HashMap<u32, SignedPreKey>>,
    sender_keys: RwLock<HashMap<(String, DeviceAddress), Vec<u8>>>,
    app_state_keys: RwLock<Vec<(Vec<u8>, AppStateSyncKey)>>,
    collections: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create a store for `device`; its signed pre-key is registered.
    pub fn new(device: DeviceKeys) -> Self {
        let mut signed_pre_keys = HashMap::new();
        signed_pre_keys.insert(device.signed_pre_key.key_id, device.signed_pre_key.clone());
        Self {
            device,
            identities: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            pre_keys: RwLock::new(HashMap::new()),
            signed_pre_keys: RwLock::new(signed_pre_keys),
            sender_keys: RwLock::new(HashMap::new()),
            app_state_keys: RwLock::new(Vec::new()),
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Create a store with freshly generated device keys.
    pub fn generate() -> Self {
        Self::new(DeviceKeys::generate())
    }

    pub fn device(&self) -> &DeviceKeys {
        &self.device
    }
}

impl IdentityStore for MemoryStore {
    fn identity_key_pair(&self) -> StoreResult<KeyPair> {
        Ok(self.device.identity_key.clone())
    }

    fn registration_id(&self) -> StoreResult<u32> {
        Ok(self.device.registration_id)
    }

    fn put_identity(&self, address: &DeviceAddress, key: [u8; 32]) -> StoreResult<bool> {
        let previous = write(&self.identities)?.insert(address.clone(), key);
        Ok(matches!(previous, Some(old) if old != key))
    }

    fn get_identity(&self, address: &DeviceAddress) -> StoreResult<Option<[u8; 32]>> {
        Ok(read(&self.identities)?.get(address).copied())
    }

    fn delete_identity(&self, address: &DeviceAddress) -> StoreResult<()> {
        write(&self.identities)?.remove(address);
        Ok(())
    }
}

impl SessionStore for MemoryStore {
    fn get_session(&self, address: &DeviceAddress) -> StoreResult<Option<Vec<u8>>> {
        Ok(read(&self.sessions)?.get(address).cloned())
    }

    fn has_session(&self, address: &DeviceAddress) -> StoreResult<bool> {
        Ok(read(&self.sessions)?.contains_key(address))
    }

    fn put_session(&self, address: &DeviceAddress, session: &[u8]) -> StoreResult<()> {
        write(&self.sessions)?.insert(address.clone(), session.to_vec());
        Ok(())
    }

    fn delete_session(&self, address: &DeviceAddress) -> StoreResult<()> {
        write(&self.sessions)?.remove(address);
        Ok(())
    }
}

impl PreKeyStore for MemoryStore {
    fn get_pre_key(&self, id: u32) -> StoreResult<Option<PreKey>> {
        Ok(read(&self.pre_keys)?.get(&id).cloned())
    }

    fn put_pre_key(&self, pre_key: &PreKey) -> StoreResult<()> {
        write(&self.pre_keys)?.insert(pre_key.key_id, pre_key.clone());
        Ok(())
    }

    fn remove_pre_key(&self, id: u32) -> StoreResult<()> {
        write(&self.pre_keys)?.remove(&id);
        Ok(())
    }

    fn pre_key_count(&self) -> StoreResult<usize> {
        Ok(read(&self.pre_keys)?.len())
    }
}

impl SignedPreKeyStore for MemoryStore {
    fn get_signed_pre_key(&self, id: u32) -> StoreResult<Option<SignedPreKey>> {
        Ok(read(&self.signed_pre_keys)?.get(&id).cloned())
    }

    fn put_signed_pre_key(&self, signed_pre_key: &SignedPreKey) -> StoreResult<()> {
        write(&self.signed_pre_keys)?.insert(signed_pre_key.key_id, signed_pre_key.clone());
        Ok(())
    }
}

impl SenderKeyStore for MemoryStore {
    fn get_sender_key(&self, group: &str, sender: &DeviceAddress) -> StoreResult<Option<Vec<u8>>> {
        Ok(read(&self.sender_keys)?
            .get(&(group.to_string(), sender.clone()))
            .cloned())
    }

    fn put_sender_key(&self, group: &str, sender: &DeviceAddress, record: &[u8]) -> StoreResult<()> {
        write(&self.sender_keys)?.insert((group.to_string(), sender.clone()), record.to_vec());
        Ok(())
    }
}

impl AppStateKeyStore for MemoryStore {
    fn get_app_state_key(&self, key_id: &[u8]) -> StoreResult<Option<AppStateSyncKey>> {
        Ok(read(&self.app_state_keys)?
            .iter()
            .find(|(id, _)| id == key_id)
            .map(|(_, key)| key.clone()))
    }

    fn put_app_state_key(&self, key_id: &[u8], key: AppStateSyncKey) -> StoreResult<()> {
        let mut keys = write(&self.app_state_keys)?;
        keys.retain(|(id, _)| id != key_id);
        keys.push((key_id.to_vec(), key));
        Ok(())
    }

    fn latest_app_state_key_id(&self) -> StoreResult<Option<Vec<u8>>> {
        // max_by_key keeps the last maximum, so later insertions win ties.
        Ok(read(&self.app_state_keys)?
            .iter()
            .max_by_key(|(_, key)| key.timestamp)
            .map(|(id, _)| id.clone()))
    }
}

impl AppStateHashStore for MemoryStore {
    fn get_collection_state(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(read(&self.collections)?.get(name).cloned())
    }

    fn put_collection_state(&self, name: &str, state: &[u8]) -> StoreResult<()> {
        write(&self.collections)?.insert(name.to_string(), state.to_vec());
        Ok(())
    }

    fn delete_collection_state(&self, name: &str) -> StoreResult<()> {
        write(&self.collections)?.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_identity() {
        let store = MemoryStore::generate();
        let address = DeviceAddress::new("123", 0);

        assert!(!store.put_identity(&address, [0xab; 32]).unwrap());
        assert!(!store.put_identity(&address, [0xab; 32]).unwrap());
        assert!(store.put_identity(&address, [0xcd; 32]).unwrap());
        assert_eq!(store.get_identity(&address).unwrap(), Some([0xcd; 32]));
    }

    #[test]
    fn test_memory_store_session() {
        let store = MemoryStore::generate();
        let address = DeviceAddress::new("123", 2);
        let session = vec![1, 2, 3, 4];

        store.put_session(&address, &session).unwrap();

        assert!(store.has_session(&address).unwrap());
        assert!(!store.has_session(&DeviceAddress::new("123", 3)).unwrap());
        assert_eq!(store.get_session(&address).unwrap(), Some(session));
    }

    #[test]
    fn test_signed_pre_key_registered() {
        let store = MemoryStore::generate();
        let id = store.device().signed_pre_key.key_id;
        assert!(store.get_signed_pre_key(id).unwrap().is_some());
    }

    #[test]
    fn test_latest_app_state_key() {
        let store = MemoryStore::generate();
        assert_eq!(store.latest_app_state_key_id().unwrap(), None);
        let key = |timestamp| AppStateSyncKey {
            key_data: vec![1; 32],
            timestamp,
        };
        store.put_app_state_key(b"old", key(10)).unwrap();
        store.put_app_state_key(b"new", key(20)).unwrap();
        store.put_app_state_key(b"mid", key(15)).unwrap();
        assert_eq!(store.latest_app_state_key_id().unwrap(), Some(b"new".to_vec()));
        assert!(store.get_app_state_key(b"mid").unwrap().is_some());
    }
}
