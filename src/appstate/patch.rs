//! Mutation records: value encryption, decoding, and the folded collection state.

use std::collections::{BTreeMap, HashMap};

use prost::Message;
use serde::{Deserialize, Serialize};

use crate::crypto::{aes_gcm_decrypt, aes_gcm_encrypt};
use crate::proto::{
    KeyId, SyncActionData, SyncActionValue, SyncdIndex, SyncdMutation, SyncdOperation, SyncdPatch, SyncdRecord,
    SyncdSnapshot, SyncdValue, SyncdVersion,
};
use crate::store::KeyStore;

use super::keys::{index_mac, patch_mac, snapshot_mac, value_mac, ExpandedKeys};
use super::lthash::LtHash;
use super::{Collection, SyncError};

const NONCE_LEN: usize = 12;
const MAC_LEN: usize = 32;
const GCM_TAG_LEN: usize = 16;

/// Version stamped into the action data this crate encrypts.
const ACTION_DATA_VERSION: i32 = 2;

/// Persisted state of one collection: its version, hash and live value MACs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionState {
    pub version: u64,
    pub hash: LtHash,
    /// hex(index MAC) -> value MAC of the live entry.
    values: BTreeMap<String, [u8; 32]>,
}

impl CollectionState {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value_mac(&self, index_mac: &[u8; 32]) -> Option<&[u8; 32]> {
        self.values.get(&hex::encode(index_mac))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(|e| SyncError::Store(e.into()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::Store(e.into()))
    }

    /// Fold mutations into the hash in list order. A set replacing a live
    /// entry also removes the old contribution. On error nothing changes.
    pub(crate) fn fold(&mut self, collection: Collection, mutations: &[DecodedMutation]) -> Result<(), SyncError> {
        let mut values = self.values.clone();
        let mut removed = Vec::new();
        let mut added = Vec::new();
        for mutation in mutations {
            let index = hex::encode(mutation.index_mac);
            match mutation.operation {
                SyncdOperation::Set => {
                    removed.extend(values.insert(index, mutation.value_mac));
                    added.push(mutation.value_mac);
                }
                SyncdOperation::Remove => {
                    let previous = values
                        .remove(&index)
                        .ok_or_else(|| conflict(collection, format!("remove of unknown index {index}")))?;
                    removed.push(previous);
                }
            }
        }
        self.hash
            .subtract_then_add(removed.iter().map(|m| &m[..]), added.iter().map(|m| &m[..]));
        self.values = values;
        Ok(())
    }
}

/// One mutation with its MACs; the action is present only when its key was known.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMutation {
    pub operation: SyncdOperation,
    pub index_mac: [u8; 32],
    pub value_mac: [u8; 32],
    pub key_id: Vec<u8>,
    pub index: Option<Vec<String>>,
    pub value: Option<SyncActionValue>,
}

impl DecodedMutation {
    pub fn is_decrypted(&self) -> bool {
        self.index.is_some()
    }
}

pub(crate) fn conflict(collection: Collection, reason: impl Into<String>) -> SyncError {
    SyncError::SyncConflict {
        collection: collection.name().to_string(),
        reason: reason.into(),
    }
}

/// Expanded keys by key id, loaded from the store once per patch.
pub(crate) struct KeyCache<'a> {
    store: &'a dyn KeyStore,
    keys: HashMap<Vec<u8>, Option<ExpandedKeys>>,
}

impl<'a> KeyCache<'a> {
    pub(crate) fn new(store: &'a dyn KeyStore) -> Self {
        Self {
            store,
            keys: HashMap::new(),
        }
    }

    pub(crate) fn get(&mut self, key_id: &[u8]) -> Result<Option<ExpandedKeys>, SyncError> {
        if let Some(keys) = self.keys.get(key_id) {
            return Ok(keys.clone());
        }
        let keys = self
            .store
            .get_app_state_key(key_id)?
            .map(|key| ExpandedKeys::expand(&key.key_data));
        self.keys.insert(key_id.to_vec(), keys.clone());
        Ok(keys)
    }

    /// Keys for a patch or snapshot; these must exist.
    pub(crate) fn require(&mut self, key_id: &[u8]) -> Result<ExpandedKeys, SyncError> {
        self.get(key_id)?
            .ok_or_else(|| SyncError::MissingKey(hex::encode(key_id)))
    }
}

pub(crate) fn key_id_of(key_id: Option<&KeyId>) -> Result<Vec<u8>, SyncError> {
    key_id
        .and_then(|k| k.id.clone())
        .ok_or_else(|| SyncError::InvalidPatch("missing key id".into()))
}

pub(crate) fn version_of(version: Option<&SyncdVersion>) -> Result<u64, SyncError> {
    version
        .and_then(|v| v.version)
        .ok_or_else(|| SyncError::InvalidPatch("missing version".into()))
}

/// Decode a patch's mutations, decrypting those whose key is available.
pub(crate) fn decode_patch_mutations(
    collection: Collection,
    patch: &SyncdPatch,
    keys: &mut KeyCache<'_>,
) -> Result<Vec<DecodedMutation>, SyncError> {
    patch
        .mutations
        .iter()
        .map(|mutation| {
            let operation = SyncdOperation::try_from(mutation.operation.unwrap_or_default())
                .map_err(|e| SyncError::InvalidPatch(e.to_string()))?;
            let record = mutation
                .record
                .as_ref()
                .ok_or_else(|| SyncError::InvalidPatch("mutation without record".into()))?;
            decode_record(collection, operation, record, keys)
        })
        .collect()
}

pub(crate) fn decode_snapshot_records(
    collection: Collection,
    snapshot: &SyncdSnapshot,
    keys: &mut KeyCache<'_>,
) -> Result<Vec<DecodedMutation>, SyncError> {
    snapshot
        .records
        .iter()
        .map(|record| decode_record(collection, SyncdOperation::Set, record, keys))
        .collect()
}

fn decode_record(
    collection: Collection,
    operation: SyncdOperation,
    record: &SyncdRecord,
    keys: &mut KeyCache<'_>,
) -> Result<DecodedMutation, SyncError> {
    let index_blob = record
        .index
        .as_ref()
        .and_then(|i| i.blob.as_deref())
        .ok_or_else(|| SyncError::InvalidPatch("record without index".into()))?;
    let index_mac_bytes: [u8; 32] = index_blob
        .try_into()
        .map_err(|_| SyncError::InvalidPatch("index MAC must be 32 bytes".into()))?;
    let blob = record
        .value
        .as_ref()
        .and_then(|v| v.blob.as_deref())
        .ok_or_else(|| SyncError::InvalidPatch("record without value".into()))?;
    if blob.len() < NONCE_LEN + GCM_TAG_LEN + MAC_LEN {
        return Err(SyncError::InvalidPatch("value blob too short".into()));
    }
    let (content, mac) = blob.split_at(blob.len() - MAC_LEN);
    let mut value_mac_bytes = [0u8; 32];
    value_mac_bytes.copy_from_slice(mac);
    let key_id = key_id_of(record.key_id.as_ref())?;

    let mut decoded = DecodedMutation {
        operation,
        index_mac: index_mac_bytes,
        value_mac: value_mac_bytes,
        key_id,
        index: None,
        value: None,
    };
    let Some(keys) = keys.get(&decoded.key_id)? else {
        return Ok(decoded);
    };

    if value_mac(&keys, operation, content, &decoded.key_id) != value_mac_bytes {
        return Err(conflict(collection, "value MAC mismatch"));
    }
    let (nonce, ciphertext) = content.split_at(NONCE_LEN);
    let plaintext = aes_gcm_decrypt(&keys.value_encryption, nonce, ciphertext, &[])?;
    let data = SyncActionData::decode(plaintext.as_slice()).map_err(|e| SyncError::InvalidPatch(e.to_string()))?;
    let index_json = data
        .index
        .ok_or_else(|| SyncError::InvalidPatch("action without index".into()))?;
    if index_mac(&keys, &index_json) != index_mac_bytes {
        return Err(conflict(collection, "index MAC mismatch"));
    }
    let index: Vec<String> =
        serde_json::from_slice(&index_json).map_err(|e| SyncError::InvalidPatch(format!("index: {e}")))?;

    decoded.index = Some(index);
    decoded.value = data.value;
    Ok(decoded)
}

fn encrypt_record(
    keys: &ExpandedKeys,
    key_id: &[u8],
    operation: SyncdOperation,
    index: &[String],
    value: Option<SyncActionValue>,
) -> Result<(SyncdRecord, DecodedMutation), SyncError> {
    let index_json = serde_json::to_vec(index).map_err(|e| SyncError::InvalidPatch(e.to_string()))?;
    let data = SyncActionData {
        index: Some(index_json.clone()),
        value: value.clone(),
        padding: Some(Vec::new()),
        version: Some(ACTION_DATA_VERSION),
    };
    let nonce: [u8; NONCE_LEN] = rand::random();
    let mut blob = nonce.to_vec();
    blob.extend(aes_gcm_encrypt(&keys.value_encryption, &nonce, &data.encode_to_vec(), &[])?);
    let value_mac = value_mac(keys, operation, &blob, key_id);
    blob.extend_from_slice(&value_mac);
    let index_mac = index_mac(keys, &index_json);

    let record = SyncdRecord {
        index: Some(SyncdIndex {
            blob: Some(index_mac.to_vec()),
        }),
        value: Some(SyncdValue { blob: Some(blob) }),
        key_id: Some(KeyId {
            id: Some(key_id.to_vec()),
        }),
    };
    let decoded = DecodedMutation {
        operation,
        index_mac,
        value_mac,
        key_id: key_id.to_vec(),
        index: Some(index.to_vec()),
        value,
    };
    Ok((record, decoded))
}

fn owned_index(index: &[&str]) -> Vec<String> {
    index.iter().map(|s| s.to_string()).collect()
}

/// Builds encrypted patches the way another device of the account would.
#[derive(Debug, Clone)]
pub struct PatchBuilder {
    collection: Collection,
    key_id: Vec<u8>,
    keys: ExpandedKeys,
    /// Key the values are encrypted under, when it differs from the signing key.
    mutation_key: Option<(Vec<u8>, ExpandedKeys)>,
    mutations: Vec<(SyncdOperation, Vec<String>, Option<SyncActionValue>)>,
}

impl PatchBuilder {
    pub fn new(collection: Collection, key_id: &[u8], key_data: &[u8]) -> Self {
        Self {
            collection,
            key_id: key_id.to_vec(),
            keys: ExpandedKeys::expand(key_data),
            mutation_key: None,
            mutations: Vec::new(),
        }
    }

    /// Encrypt values under another key than the one that signs the patch,
    /// as a device still holding a rotated-out key does.
    pub fn with_mutation_key(mut self, key_id: &[u8], key_data: &[u8]) -> Self {
        self.mutation_key = Some((key_id.to_vec(), ExpandedKeys::expand(key_data)));
        self
    }

    pub fn set(mut self, index: &[&str], value: SyncActionValue) -> Self {
        self.mutations.push((SyncdOperation::Set, owned_index(index), Some(value)));
        self
    }

    pub fn remove(mut self, index: &[&str]) -> Self {
        self.mutations.push((SyncdOperation::Remove, owned_index(index), None));
        self
    }

    /// Encrypt and sign the mutations as the patch that follows `state`, and
    /// advance `state` to the result.
    pub fn build(self, state: &mut CollectionState) -> Result<SyncdPatch, SyncError> {
        let name = self.collection.name();
        let mut mutations = Vec::with_capacity(self.mutations.len());
        let mut decoded = Vec::with_capacity(self.mutations.len());
        let (value_key_id, value_keys) = match &self.mutation_key {
            Some((id, keys)) => (id.as_slice(), keys),
            None => (self.key_id.as_slice(), &self.keys),
        };
        for (operation, index, value) in self.mutations {
            let (record, mutation) = encrypt_record(value_keys, value_key_id, operation, &index, value)?;
            mutations.push(SyncdMutation {
                operation: Some(operation as i32),
                record: Some(record),
            });
            decoded.push(mutation);
        }

        let mut next = state.clone();
        next.fold(self.collection, &decoded)?;
        next.version += 1;
        let snapshot = snapshot_mac(&self.keys, &next.hash, next.version, name);
        let value_macs: Vec<&[u8]> = decoded.iter().map(|m| &m.value_mac[..]).collect();
        let signature = patch_mac(&self.keys, &snapshot, &value_macs, next.version, name);

        let patch = SyncdPatch {
            version: Some(SyncdVersion {
                version: Some(next.version),
            }),
            mutations,
            snapshot_mac: Some(snapshot.to_vec()),
            patch_mac: Some(signature.to_vec()),
            key_id: Some(KeyId {
                id: Some(self.key_id),
            }),
            exit_code: None,
            device_index: None,
        };
        *state = next;
        Ok(patch)
    }
}

/// Encrypt `entries` as a snapshot of `collection` at `version`.
pub fn build_snapshot(
    collection: Collection,
    key_id: &[u8],
    key_data: &[u8],
    version: u64,
    entries: &[(&[&str], SyncActionValue)],
) -> Result<(SyncdSnapshot, CollectionState), SyncError> {
    let keys = ExpandedKeys::expand(key_data);
    let mut records = Vec::with_capacity(entries.len());
    let mut decoded = Vec::with_capacity(entries.len());
    for (index, value) in entries {
        let (record, mutation) =
            encrypt_record(&keys, key_id, SyncdOperation::Set, &owned_index(index), Some(value.clone()))?;
        records.push(record);
        decoded.push(mutation);
    }
    let mut state = CollectionState::default();
    state.fold(collection, &decoded)?;
    state.version = version;
    let mac = snapshot_mac(&keys, &state.hash, version, collection.name());
    let snapshot = SyncdSnapshot {
        version: Some(SyncdVersion { version: Some(version) }),
        records,
        mac: Some(mac.to_vec()),
        key_id: Some(KeyId {
            id: Some(key_id.to_vec()),
        }),
    };
    Ok((snapshot, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::MuteAction;
    use crate::store::{AppStateKeyStore, AppStateSyncKey, MemoryStore};

    const KEY_ID: &[u8] = b"key-1";
    const KEY_DATA: [u8; 32] = [5; 32];

    fn mute(muted: bool) -> SyncActionValue {
        SyncActionValue {
            timestamp: Some(1_700_000_000),
            mute_action: Some(MuteAction {
                muted: Some(muted),
                mute_end_timestamp: None,
            }),
            ..Default::default()
        }
    }

    fn store_with_key() -> MemoryStore {
        let store = MemoryStore::generate();
        store
            .put_app_state_key(
                KEY_ID,
                AppStateSyncKey {
                    key_data: KEY_DATA.to_vec(),
                    timestamp: 1,
                },
            )
            .unwrap();
        store
    }

    #[test]
    fn test_built_patch_decodes_with_known_key() {
        let store = store_with_key();
        let mut sender = CollectionState::default();
        let patch = PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .set(&["mute", "123@s.whatsapp.net"], mute(true))
            .build(&mut sender)
            .unwrap();
        assert_eq!(sender.version, 1);
        assert_eq!(sender.len(), 1);

        let mut keys = KeyCache::new(&store);
        let decoded = decode_patch_mutations(Collection::Regular, &patch, &mut keys).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(
            decoded[0].index.as_deref(),
            Some(&["mute".to_string(), "123@s.whatsapp.net".to_string()][..])
        );
        assert_eq!(decoded[0].value.as_ref().unwrap().mute_action.as_ref().unwrap().muted, Some(true));
    }

    #[test]
    fn test_unknown_key_keeps_macs() {
        let store = MemoryStore::generate();
        let mut sender = CollectionState::default();
        let patch = PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .set(&["pin_v1", "1@s.whatsapp.net"], SyncActionValue::default())
            .build(&mut sender)
            .unwrap();

        let mut keys = KeyCache::new(&store);
        let decoded = decode_patch_mutations(Collection::Regular, &patch, &mut keys).unwrap();
        assert!(!decoded[0].is_decrypted());

        let mut state = CollectionState::default();
        state.fold(Collection::Regular, &decoded).unwrap();
        assert_eq!(state.hash, sender.hash);
    }

    #[test]
    fn test_tampered_value_is_conflict() {
        let store = store_with_key();
        let mut sender = CollectionState::default();
        let mut patch = PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .set(&["archive", "1@s.whatsapp.net"], SyncActionValue::default())
            .build(&mut sender)
            .unwrap();
        let blob = patch.mutations[0]
            .record
            .as_mut()
            .and_then(|r| r.value.as_mut())
            .and_then(|v| v.blob.as_mut())
            .unwrap();
        blob[NONCE_LEN] ^= 1;

        let mut keys = KeyCache::new(&store);
        assert!(matches!(
            decode_patch_mutations(Collection::Regular, &patch, &mut keys),
            Err(SyncError::SyncConflict { .. })
        ));
    }

    #[test]
    fn test_remove_of_unknown_index_is_conflict() {
        let mut sender = CollectionState::default();
        let result = PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .remove(&["mute", "9@s.whatsapp.net"])
            .build(&mut sender);
        assert!(matches!(result, Err(SyncError::SyncConflict { .. })));
        assert_eq!(sender, CollectionState::default());
    }

    #[test]
    fn test_same_index_twice_keeps_last_contribution() {
        let store = store_with_key();
        let mut sender = CollectionState::default();
        let patch = PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .set(&["mute", "1"], mute(true))
            .set(&["mute", "1"], mute(false))
            .build(&mut sender)
            .unwrap();
        assert_eq!(patch.mutations.len(), 2);
        assert_eq!(sender.len(), 1);

        let mut keys = KeyCache::new(&store);
        let decoded = decode_patch_mutations(Collection::Regular, &patch, &mut keys).unwrap();
        let mut expected = LtHash::default();
        expected.add(&decoded[1].value_mac);
        assert_eq!(sender.hash, expected);
        assert_eq!(sender.value_mac(&decoded[1].index_mac), Some(&decoded[1].value_mac));
    }

    #[test]
    fn test_snapshot_state_and_serde() {
        let (snapshot, state) = build_snapshot(
            Collection::RegularHigh,
            KEY_ID,
            &KEY_DATA,
            7,
            &[(&["mute", "1"], mute(true)), (&["mute", "2"], mute(false))],
        )
        .unwrap();
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(state.version, 7);
        let restored = CollectionState::from_bytes(&state.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, state);
    }

    fn raw(operation: SyncdOperation, index: u8, value: u8) -> DecodedMutation {
        DecodedMutation {
            operation,
            index_mac: [index; 32],
            value_mac: [value; 32],
            key_id: KEY_ID.to_vec(),
            index: None,
            value: None,
        }
    }

    #[test]
    fn test_fold_replaces_and_is_all_or_nothing() {
        let mut overwritten = CollectionState::default();
        overwritten
            .fold(
                Collection::Regular,
                &[raw(SyncdOperation::Set, 1, 10), raw(SyncdOperation::Set, 1, 11)],
            )
            .unwrap();
        let mut direct = CollectionState::default();
        direct.fold(Collection::Regular, &[raw(SyncdOperation::Set, 1, 11)]).unwrap();
        assert_eq!(overwritten, direct);
        assert_eq!(overwritten.value_mac(&[1; 32]), Some(&[11; 32]));

        let before = direct.clone();
        let err = direct
            .fold(
                Collection::Regular,
                &[raw(SyncdOperation::Set, 2, 20), raw(SyncdOperation::Remove, 3, 0)],
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::SyncConflict { .. }));
        assert_eq!(direct, before);
    }
}
