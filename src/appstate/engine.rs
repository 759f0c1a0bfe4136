//! The sync engine: ordered patch application, validation, and resync.

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};

use crate::proto::{SyncdPatch, SyncdSnapshot};
use crate::signal::KeyedLocks;
use crate::store::KeyStore;
use crate::types::{Event, EventHandlers, SyncConflict};

use super::events::{AppStateMutation, MutationSink};
use super::keys::{patch_mac, snapshot_mac};
use super::patch::{
    conflict, decode_patch_mutations, decode_snapshot_records, key_id_of, version_of, CollectionState,
    DecodedMutation, KeyCache,
};
use super::source::PatchSource;
use super::{Collection, SyncError};

/// Outcome of one sync call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub collection: Collection,
    /// Local version after the call.
    pub version: u64,
    pub patches_applied: usize,
    pub mutations_applied: usize,
    /// Mutations folded into the hash whose key was unavailable.
    pub mutations_skipped: usize,
    /// Local state was discarded and rebuilt from a snapshot.
    pub resynced: bool,
}

impl SyncSummary {
    fn new(collection: Collection) -> Self {
        Self {
            collection,
            version: 0,
            patches_applied: 0,
            mutations_applied: 0,
            mutations_skipped: 0,
            resynced: false,
        }
    }
}

/// Keeps app-state collections in step with the server.
pub struct AppStateSync {
    store: Arc<dyn KeyStore>,
    source: Arc<dyn PatchSource>,
    sink: Arc<dyn MutationSink>,
    handlers: EventHandlers,
    locks: KeyedLocks<Collection>,
}

impl AppStateSync {
    pub fn new(
        store: Arc<dyn KeyStore>,
        source: Arc<dyn PatchSource>,
        sink: Arc<dyn MutationSink>,
        handlers: EventHandlers,
    ) -> Self {
        Self {
            store,
            source,
            sink,
            handlers,
            locks: KeyedLocks::new(),
        }
    }

    /// The last validated state of `collection`.
    pub fn state(&self, collection: Collection) -> Result<CollectionState, SyncError> {
        match self.store.get_collection_state(collection.name())? {
            Some(bytes) => CollectionState::from_bytes(&bytes),
            None => Ok(CollectionState::default()),
        }
    }

    /// Pull and apply every patch newer than the local version.
    pub async fn sync(&self, collection: Collection) -> Result<SyncSummary, SyncError> {
        let lock = self.locks.get(&collection);
        let _guard = lock.lock().await;

        let mut summary = SyncSummary::new(collection);
        match self.pull(collection, false, &mut summary).await {
            Err(SyncError::SyncConflict { reason, .. }) => self.resync(collection, reason, summary).await,
            Err(e) => Err(e),
            Ok(()) => Ok(summary),
        }
    }

    /// Sync several collections concurrently.
    pub async fn sync_all(&self, collections: &[Collection]) -> Vec<Result<SyncSummary, SyncError>> {
        join_all(collections.iter().map(|c| self.sync(*c))).await
    }

    /// Apply patches pushed by the server. Each must follow the local
    /// version exactly; the first one that does not is rejected.
    pub async fn handle_patches(
        &self,
        collection: Collection,
        patches: &[SyncdPatch],
    ) -> Result<SyncSummary, SyncError> {
        let lock = self.locks.get(&collection);
        let _guard = lock.lock().await;

        let mut summary = SyncSummary::new(collection);
        let mut state = self.state(collection)?;
        summary.version = state.version;
        for patch in patches {
            match self.apply_patch(collection, &mut state, patch, &mut summary) {
                Ok(()) => {}
                Err(SyncError::SyncConflict { reason, .. }) => {
                    return self.resync(collection, reason, summary).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    async fn resync(
        &self,
        collection: Collection,
        reason: String,
        mut summary: SyncSummary,
    ) -> Result<SyncSummary, SyncError> {
        warn!("App state {collection} failed validation ({reason}), resyncing from snapshot");
        self.store.delete_collection_state(collection.name())?;
        self.sink.reset(collection);
        self.handlers.dispatch(&Event::SyncConflict(SyncConflict {
            collection: collection.name().to_string(),
            reason,
        }));
        summary.resynced = true;
        self.pull(collection, true, &mut summary).await?;
        Ok(summary)
    }

    async fn pull(&self, collection: Collection, force_snapshot: bool, summary: &mut SyncSummary) -> Result<(), SyncError> {
        let mut state = self.state(collection)?;
        summary.version = state.version;
        let mut want_snapshot = force_snapshot || state.version == 0;
        loop {
            let list = self.source.fetch(collection, state.version, want_snapshot).await?;
            let start_version = state.version;
            if let Some(snapshot) = &list.snapshot {
                state = self.apply_snapshot(collection, snapshot, summary)?;
            }
            for patch in &list.patches {
                if version_of(patch.version.as_ref())? <= state.version {
                    debug!("Skipping already applied {collection} patch");
                    continue;
                }
                self.apply_patch(collection, &mut state, patch, summary)?;
            }
            if !list.has_more {
                break;
            }
            // Asking again from the same version would get the same page.
            if list.snapshot.is_none() && state.version == start_version {
                return Err(SyncError::InvalidPatch(format!(
                    "{collection} page after version {start_version} claims more patches but carries none"
                )));
            }
            want_snapshot = false;
        }
        info!("App state {collection} synced to version {}", state.version);
        Ok(())
    }

    fn apply_snapshot(
        &self,
        collection: Collection,
        snapshot: &SyncdSnapshot,
        summary: &mut SyncSummary,
    ) -> Result<CollectionState, SyncError> {
        let version = version_of(snapshot.version.as_ref())?;
        let mut keys = KeyCache::new(self.store.as_ref());
        let snapshot_keys = keys.require(&key_id_of(snapshot.key_id.as_ref())?)?;
        let mutations = decode_snapshot_records(collection, snapshot, &mut keys)?;

        let mut state = CollectionState::default();
        state.fold(collection, &mutations)?;
        state.version = version;
        let expected = snapshot_mac(&snapshot_keys, &state.hash, version, collection.name());
        if snapshot.mac.as_deref() != Some(&expected[..]) {
            return Err(conflict(collection, "snapshot MAC mismatch"));
        }

        self.store.put_collection_state(collection.name(), &state.to_bytes()?)?;
        self.sink.reset(collection);
        self.materialize(collection, &mutations, summary);
        summary.version = version;
        debug!("Applied {collection} snapshot at version {version} with {} records", mutations.len());
        Ok(state)
    }

    /// Validate `patch` against `state` and commit it. On error `state` and
    /// the stored state are unchanged.
    fn apply_patch(
        &self,
        collection: Collection,
        state: &mut CollectionState,
        patch: &SyncdPatch,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        let version = version_of(patch.version.as_ref())?;
        if version != state.version + 1 {
            return Err(SyncError::VersionMismatch {
                current: state.version,
                got: version,
            });
        }
        let name = collection.name();
        let mut keys = KeyCache::new(self.store.as_ref());
        let patch_keys = keys.require(&key_id_of(patch.key_id.as_ref())?)?;
        let mutations = decode_patch_mutations(collection, patch, &mut keys)?;

        let mut next = state.clone();
        next.fold(collection, &mutations)?;
        next.version = version;

        let expected_hash = snapshot_mac(&patch_keys, &next.hash, version, name);
        if patch.snapshot_mac.as_deref() != Some(&expected_hash[..]) {
            return Err(conflict(collection, format!("hash mismatch at version {version}")));
        }
        let value_macs: Vec<&[u8]> = mutations.iter().map(|m| &m.value_mac[..]).collect();
        let expected_signature = patch_mac(&patch_keys, &expected_hash, &value_macs, version, name);
        if patch.patch_mac.as_deref() != Some(&expected_signature[..]) {
            return Err(conflict(collection, format!("patch MAC mismatch at version {version}")));
        }

        self.store.put_collection_state(name, &next.to_bytes()?)?;
        *state = next;
        self.materialize(collection, &mutations, summary);
        summary.patches_applied += 1;
        summary.version = version;
        debug!("Applied {collection} patch {version} with {} mutations", mutations.len());
        Ok(())
    }

    /// Forward the net effect of `mutations`: a later entry for the same
    /// index replaces an earlier one.
    fn materialize(&self, collection: Collection, mutations: &[DecodedMutation], summary: &mut SyncSummary) {
        let mut net: Vec<&DecodedMutation> = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            if !mutation.is_decrypted() {
                warn!(
                    "Skipping {collection} mutation encrypted with unknown key {}",
                    hex::encode(&mutation.key_id)
                );
                summary.mutations_skipped += 1;
                continue;
            }
            net.retain(|m| m.index_mac != mutation.index_mac);
            net.push(mutation);
        }
        for mutation in net.into_iter().filter_map(AppStateMutation::from_decoded) {
            self.sink.apply(collection, &mutation);
            summary.mutations_applied += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::appstate::events::{AppStateEvent, MemorySink};
    use crate::appstate::patch::{build_snapshot, PatchBuilder};
    use crate::appstate::source::MemoryPatchSource;
    use crate::proto::{MuteAction, SyncActionValue};
    use crate::store::{AppStateKeyStore, AppStateSyncKey, MemoryStore};

    const KEY_ID: &[u8] = b"key-1";
    const KEY_DATA: [u8; 32] = [3; 32];

    fn mute() -> SyncActionValue {
        SyncActionValue {
            timestamp: Some(1_700_000_000),
            mute_action: Some(MuteAction {
                muted: Some(true),
                mute_end_timestamp: Some(1_800_000_000),
            }),
            ..Default::default()
        }
    }

    struct Harness {
        engine: AppStateSync,
        source: Arc<MemoryPatchSource>,
        sink: Arc<MemorySink>,
        conflicts: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::generate());
        store
            .put_app_state_key(
                KEY_ID,
                AppStateSyncKey {
                    key_data: KEY_DATA.to_vec(),
                    timestamp: 1,
                },
            )
            .unwrap();
        let source = Arc::new(MemoryPatchSource::new(10));
        let sink = Arc::new(MemorySink::new());
        let conflicts = Arc::new(AtomicUsize::new(0));
        let counter = conflicts.clone();
        let handlers = EventHandlers::new().on_sync_conflict(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let engine = AppStateSync::new(store.clone(), source.clone(), sink.clone(), handlers);
        Harness {
            engine,
            source,
            sink,
            conflicts,
        }
    }

    /// Bring the local collection to version 4 via a snapshot.
    async fn at_version_four(h: &Harness) -> CollectionState {
        let (snapshot, state) =
            build_snapshot(Collection::Regular, KEY_ID, &KEY_DATA, 4, &[(&["pin_v1", "9"], SyncActionValue::default())])
                .unwrap();
        h.source.set_snapshot(snapshot);
        let summary = h.engine.sync(Collection::Regular).await.unwrap();
        assert_eq!(summary.version, 4);
        state
    }

    #[tokio::test]
    async fn test_add_then_remove_restores_hash() {
        let h = harness();
        let mut remote = at_version_four(&h).await;
        let before = h.engine.state(Collection::Regular).unwrap();

        let v5 = PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .set(&["mute", "123"], mute())
            .build(&mut remote)
            .unwrap();
        let v6 = PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .remove(&["mute", "123"])
            .build(&mut remote)
            .unwrap();

        h.engine.handle_patches(Collection::Regular, &[v5]).await.unwrap();
        assert!(matches!(
            h.sink.get(Collection::Regular, &["mute", "123"]).map(|m| m.event),
            Some(AppStateEvent::Mute { muted: true, .. })
        ));

        let summary = h.engine.handle_patches(Collection::Regular, &[v6]).await.unwrap();
        assert_eq!(summary.version, 6);
        let after = h.engine.state(Collection::Regular).unwrap();
        assert_eq!(after.version, 6);
        assert_eq!(after.hash, before.hash);
        assert!(h.sink.get(Collection::Regular, &["mute", "123"]).is_none());
        assert!(h.sink.get(Collection::Regular, &["pin_v1", "9"]).is_some());
    }

    #[tokio::test]
    async fn test_out_of_order_version_rejected_without_change() {
        let h = harness();
        let mut remote = at_version_four(&h).await;
        let before = h.engine.state(Collection::Regular).unwrap();

        let _v5 = PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .set(&["mute", "1"], mute())
            .build(&mut remote)
            .unwrap();
        let v6 = PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .set(&["mute", "2"], mute())
            .build(&mut remote)
            .unwrap();

        assert_eq!(
            h.engine.handle_patches(Collection::Regular, &[v6]).await.unwrap_err(),
            SyncError::VersionMismatch { current: 4, got: 6 }
        );
        assert_eq!(h.engine.state(Collection::Regular).unwrap(), before);
        assert!(h.sink.get(Collection::Regular, &["mute", "2"]).is_none());
    }

    #[tokio::test]
    async fn test_sync_pages_through_patches() {
        let h = harness();
        let mut remote = CollectionState::default();
        for chat in ["1", "2", "3"] {
            h.source.push_patch(
                PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
                    .set(&["mute", chat], mute())
                    .build(&mut remote)
                    .unwrap(),
            );
        }
        let summary = h.engine.sync(Collection::Regular).await.unwrap();
        assert_eq!(summary.patches_applied, 3);
        assert_eq!(summary.mutations_applied, 3);
        assert_eq!(h.engine.state(Collection::Regular).unwrap(), remote);
        assert_eq!(h.sink.len(Collection::Regular), 3);

        let again = h.engine.sync(Collection::Regular).await.unwrap();
        assert_eq!(again.patches_applied, 0);
        assert_eq!(again.version, 3);
    }

    #[tokio::test]
    async fn test_unknown_mutation_key_is_skipped_but_hashed() {
        let h = harness();
        let mut remote = at_version_four(&h).await;
        let patch = PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .with_mutation_key(b"retired-key", &[8; 32])
            .set(&["mute", "5"], mute())
            .build(&mut remote)
            .unwrap();

        let summary = h.engine.handle_patches(Collection::Regular, &[patch]).await.unwrap();
        assert_eq!(summary.mutations_skipped, 1);
        assert_eq!(summary.mutations_applied, 0);
        assert_eq!(h.engine.state(Collection::Regular).unwrap(), remote);
        assert!(h.sink.get(Collection::Regular, &["mute", "5"]).is_none());
    }

    #[tokio::test]
    async fn test_unknown_patch_key_is_missing_key() {
        let h = harness();
        let mut remote = at_version_four(&h).await;
        let patch = PatchBuilder::new(Collection::Regular, b"other-key", &[8; 32])
            .set(&["mute", "5"], mute())
            .build(&mut remote)
            .unwrap();
        let before = h.engine.state(Collection::Regular).unwrap();
        assert_eq!(
            h.engine.handle_patches(Collection::Regular, &[patch]).await.unwrap_err(),
            SyncError::MissingKey(hex::encode(b"other-key"))
        );
        assert_eq!(h.engine.state(Collection::Regular).unwrap(), before);
    }

    #[tokio::test]
    async fn test_hash_mismatch_triggers_snapshot_resync() {
        let h = harness();
        let mut remote = at_version_four(&h).await;
        let mut bad = PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .set(&["mute", "7"], mute())
            .build(&mut remote)
            .unwrap();
        if let Some(mac) = bad.snapshot_mac.as_mut() {
            mac[0] ^= 1;
        }

        let (snapshot, _) =
            build_snapshot(Collection::Regular, KEY_ID, &KEY_DATA, 5, &[(&["mute", "7"], mute())]).unwrap();
        h.source.set_snapshot(snapshot);

        let summary = h.engine.handle_patches(Collection::Regular, &[bad]).await.unwrap();
        assert!(summary.resynced);
        assert_eq!(summary.version, 5);
        assert_eq!(h.conflicts.load(Ordering::SeqCst), 1);
        assert_eq!(h.source.fetches().last(), Some(&(0, true)));
        assert!(h.sink.get(Collection::Regular, &["pin_v1", "9"]).is_none());
        assert!(h.sink.get(Collection::Regular, &["mute", "7"]).is_some());
    }

    #[tokio::test]
    async fn test_bad_snapshot_fails_after_one_retry() {
        let h = harness();
        let (mut snapshot, _) =
            build_snapshot(Collection::Regular, KEY_ID, &KEY_DATA, 2, &[(&["mute", "1"], mute())]).unwrap();
        if let Some(mac) = snapshot.mac.as_mut() {
            mac[0] ^= 1;
        }
        h.source.set_snapshot(snapshot);

        let err = h.engine.sync(Collection::Regular).await.unwrap_err();
        assert!(matches!(err, SyncError::SyncConflict { .. }));
        assert_eq!(h.conflicts.load(Ordering::SeqCst), 1);
        assert_eq!(h.source.fetches(), vec![(0, true), (0, true)]);
        assert_eq!(h.engine.state(Collection::Regular).unwrap(), CollectionState::default());
    }

    #[tokio::test]
    async fn test_collections_sync_independently() {
        let h = harness();
        let results = h.engine.sync_all(&[Collection::Regular, Collection::RegularLow]).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(h.source.fetches().len(), 2);
    }

    /// Always claims more history and never delivers any.
    struct StalledSource(AtomicUsize);

    #[async_trait::async_trait]
    impl PatchSource for StalledSource {
        async fn fetch(&self, _: Collection, _: u64, _: bool) -> Result<crate::appstate::PatchList, SyncError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(crate::appstate::PatchList {
                snapshot: None,
                patches: Vec::new(),
                has_more: true,
            })
        }
    }

    #[tokio::test]
    async fn test_page_without_progress_ends_sync() {
        let source = Arc::new(StalledSource(AtomicUsize::new(0)));
        let engine = AppStateSync::new(
            Arc::new(MemoryStore::generate()),
            source.clone(),
            Arc::new(MemorySink::new()),
            EventHandlers::new(),
        );
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), engine.sync(Collection::RegularHigh))
            .await
            .expect("sync returned");
        assert!(matches!(result, Err(SyncError::InvalidPatch(_))));
        assert_eq!(source.0.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(Collection::RegularHigh).unwrap().version, 0);
    }
}
