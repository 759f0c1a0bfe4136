//! App-state key expansion and the MACs that protect patches.

use crate::crypto::{hmac_sha256, hmac_sha512, Hkdf};
use crate::proto::SyncdOperation;

use super::lthash::LtHash;

/// The five keys derived from one app-state sync key.
#[derive(Clone, PartialEq, Eq)]
pub struct ExpandedKeys {
    pub index: [u8; 32],
    pub value_encryption: [u8; 32],
    pub value_mac: [u8; 32],
    pub snapshot_mac: [u8; 32],
    pub patch_mac: [u8; 32],
}

impl ExpandedKeys {
    pub fn expand(key_data: &[u8]) -> Self {
        let okm = Hkdf::derive(None, key_data, b"WhatsApp Mutation Keys", 160);
        let part = |i: usize| {
            let mut key = [0u8; 32];
            key.copy_from_slice(&okm[i * 32..(i + 1) * 32]);
            key
        };
        Self {
            index: part(0),
            value_encryption: part(1),
            value_mac: part(2),
            snapshot_mac: part(3),
            patch_mac: part(4),
        }
    }
}

impl std::fmt::Debug for ExpandedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExpandedKeys([REDACTED])")
    }
}

pub fn index_mac(keys: &ExpandedKeys, index_json: &[u8]) -> [u8; 32] {
    hmac_sha256(&keys.index, &[index_json])
}

/// MAC over an encrypted value, bound to the operation and key id.
pub fn value_mac(keys: &ExpandedKeys, operation: SyncdOperation, data: &[u8], key_id: &[u8]) -> [u8; 32] {
    let op = [operation as u8 + 1];
    let key_len = (key_id.len() as u64 + 1).to_be_bytes();
    let full = hmac_sha512(&keys.value_mac, &[&op, key_id, data, &key_len]);
    let mut mac = [0u8; 32];
    mac.copy_from_slice(&full[..32]);
    mac
}

/// MAC over the collection hash at `version`; a patch declares it as its hash.
pub fn snapshot_mac(keys: &ExpandedKeys, hash: &LtHash, version: u64, name: &str) -> [u8; 32] {
    hmac_sha256(
        &keys.snapshot_mac,
        &[hash.as_bytes(), &version.to_be_bytes(), name.as_bytes()],
    )
}

/// MAC that signs a whole patch.
pub fn patch_mac(keys: &ExpandedKeys, snapshot_mac: &[u8], value_macs: &[&[u8]], version: u64, name: &str) -> [u8; 32] {
    let version = version.to_be_bytes();
    let mut parts: Vec<&[u8]> = Vec::with_capacity(value_macs.len() + 3);
    parts.push(snapshot_mac);
    parts.extend_from_slice(value_macs);
    parts.push(&version);
    parts.push(name.as_bytes());
    hmac_sha256(&keys.patch_mac, &parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expanded_keys_are_distinct() {
        let keys = ExpandedKeys::expand(&[9u8; 32]);
        let all = [keys.index, keys.value_encryption, keys.value_mac, keys.snapshot_mac, keys.patch_mac];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(ExpandedKeys::expand(&[9u8; 32]), keys);
    }

    #[test]
    fn test_value_mac_binds_operation() {
        let keys = ExpandedKeys::expand(&[1u8; 32]);
        let set = value_mac(&keys, SyncdOperation::Set, b"data", b"key");
        let remove = value_mac(&keys, SyncdOperation::Remove, b"data", b"key");
        assert_ne!(set, remove);
        assert_ne!(set, value_mac(&keys, SyncdOperation::Set, b"data", b"key2"));
    }

    #[test]
    fn test_snapshot_mac_binds_version_and_name() {
        let keys = ExpandedKeys::expand(&[2u8; 32]);
        let hash = LtHash::default();
        let mac = snapshot_mac(&keys, &hash, 1, "regular");
        assert_ne!(mac, snapshot_mac(&keys, &hash, 2, "regular"));
        assert_ne!(mac, snapshot_mac(&keys, &hash, 1, "regular_low"));
    }
}
