//! Key material that identifies this device.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::crypto::{KeyPair, PreKey, SignedPreKey};

/// Long-lived keys of the local device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// Static key for the transport handshake
    pub noise_key: KeyPair,
    /// Signal identity key pair
    pub identity_key: KeyPair,
    pub signed_pre_key: SignedPreKey,
    /// 14-bit registration id
    pub registration_id: u32,
}

impl DeviceKeys {
    /// Fresh keys with signed pre-key id 1.
    pub fn generate() -> Self {
        let identity_key = KeyPair::generate();
        let signed_pre_key = SignedPreKey::generate(1, &identity_key);
        Self {
            noise_key: KeyPair::generate(),
            identity_key,
            signed_pre_key,
            registration_id: rand::thread_rng().gen_range(1..16380),
        }
    }
}

/// Generate `count` one-time pre-keys with consecutive ids starting at `start`.
pub fn generate_pre_keys(start: u32, count: u32) -> Vec<PreKey> {
    (start..start.saturating_add(count)).map(PreKey::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_signed() {
        let keys = DeviceKeys::generate();
        assert!(keys.signed_pre_key.verify(&keys.identity_key.public));
        assert!((1..16380).contains(&keys.registration_id));
        assert_ne!(keys.noise_key, keys.identity_key);
    }

    #[test]
    fn test_pre_key_ids() {
        let keys = generate_pre_keys(5, 3);
        let ids: Vec<u32> = keys.iter().map(|k| k.key_id).collect();
        assert_eq!(ids, vec![5, 6, 7]);
    }
}
