//! App-state synchronization.
//!
//! Each collection is a versioned key/value set kept consistent across a
//! user's devices by encrypted mutation patches. Patches are applied
//! strictly in version order and checked against an [`LtHash`] over the
//! live value MACs; any mismatch throws local state away and rebuilds the
//! collection from a snapshot.

mod engine;
mod events;
mod keys;
mod lthash;
mod patch;
mod source;

use std::fmt;
use std::str::FromStr;

use crate::crypto::CryptoError;
use crate::protocol::RequestError;
use crate::store::StoreError;

pub use engine::{AppStateSync, SyncSummary};
pub use events::{AppStateEvent, AppStateMutation, MemorySink, MutationSink};
pub use keys::{index_mac, patch_mac, snapshot_mac, value_mac, ExpandedKeys};
pub use lthash::{LtHash, LTHASH_SIZE};
pub use patch::{build_snapshot, CollectionState, DecodedMutation, PatchBuilder};
pub use source::{
    build_sync_request, build_sync_response, parse_sync_response, MemoryPatchSource, NodePatchSource, PatchList,
    PatchSource, APP_STATE_XMLNS,
};

/// Errors raised while syncing a collection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("patch version {got} does not follow local version {current}")]
    VersionMismatch { current: u64, got: u64 },
    #[error("app state key {0} not found")]
    MissingKey(String),
    #[error("sync conflict in {collection}: {reason}")]
    SyncConflict { collection: String, reason: String },
    #[error("invalid patch: {0}")]
    InvalidPatch(String),
    #[error("unknown collection {0}")]
    UnknownCollection(String),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The app-state collections the service keeps per account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    CriticalBlock,
    CriticalUnblockLow,
    RegularHigh,
    Regular,
    RegularLow,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::CriticalBlock,
        Collection::CriticalUnblockLow,
        Collection::RegularHigh,
        Collection::Regular,
        Collection::RegularLow,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Collection::CriticalBlock => "critical_block",
            Collection::CriticalUnblockLow => "critical_unblock_low",
            Collection::RegularHigh => "regular_high",
            Collection::Regular => "regular",
            Collection::RegularLow => "regular_low",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| SyncError::UnknownCollection(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names_roundtrip() {
        for collection in Collection::ALL {
            assert_eq!(collection.name().parse::<Collection>().unwrap(), collection);
        }
        assert_eq!(
            "regular_medium".parse::<Collection>(),
            Err(SyncError::UnknownCollection("regular_medium".into()))
        );
    }
}
