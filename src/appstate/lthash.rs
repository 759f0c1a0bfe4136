//! Summation hash over a multiset of value MACs.
//!
//! Each contribution is expanded to 128 bytes with HKDF and folded in as 64
//! little-endian u16 lanes with wrapping arithmetic, so adding and later
//! subtracting the same MAC restores the previous hash exactly.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::Hkdf;

pub const LTHASH_SIZE: usize = 128;

const EXPAND_INFO: &[u8] = b"WhatsApp Patch Integrity";

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LtHash([u8; LTHASH_SIZE]);

impl Default for LtHash {
    fn default() -> Self {
        Self([0; LTHASH_SIZE])
    }
}

impl LtHash {
    pub fn from_bytes(bytes: [u8; LTHASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LTHASH_SIZE] {
        &self.0
    }

    pub fn add(&mut self, item: &[u8]) {
        self.fold(item, u16::wrapping_add);
    }

    pub fn subtract(&mut self, item: &[u8]) {
        self.fold(item, u16::wrapping_sub);
    }

    /// Remove `subtract` then add `add`, as one patch step does.
    pub fn subtract_then_add<'a>(
        &mut self,
        subtract: impl IntoIterator<Item = &'a [u8]>,
        add: impl IntoIterator<Item = &'a [u8]>,
    ) {
        for item in subtract {
            self.subtract(item);
        }
        for item in add {
            self.add(item);
        }
    }

    fn fold(&mut self, item: &[u8], op: fn(u16, u16) -> u16) {
        let expanded = Hkdf::derive(None, item, EXPAND_INFO, LTHASH_SIZE);
        for (lane, other) in self.0.chunks_exact_mut(2).zip(expanded.chunks_exact(2)) {
            let a = u16::from_le_bytes([lane[0], lane[1]]);
            let b = u16::from_le_bytes([other[0], other[1]]);
            lane.copy_from_slice(&op(a, b).to_le_bytes());
        }
    }
}

impl fmt::Debug for LtHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LtHash({}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for LtHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for LtHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(&raw).map_err(serde::de::Error::custom)?;
        let bytes: [u8; LTHASH_SIZE] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("lthash must be 128 bytes"))?;
        Ok(Self(bytes))
    }
}
