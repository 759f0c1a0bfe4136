mod common;

use std::sync::Arc;

use common::{connect_pair, Relay};
use tokio::sync::mpsc;
use whatsapp_engine::appstate::{
    build_snapshot, build_sync_response, AppStateEvent, AppStateSync, Collection, MemoryPatchSource, MemorySink,
    NodePatchSource, PatchBuilder, PatchSource, SyncError,
};
use whatsapp_engine::proto::{MuteAction, SyncActionValue};
use whatsapp_engine::store::{AppStateKeyStore, AppStateSyncKey, MemoryStore};
use whatsapp_engine::types::EventHandlers;

const KEY_ID: &[u8] = b"integration-key";
const KEY_DATA: [u8; 32] = [42; 32];

fn muted() -> SyncActionValue {
    SyncActionValue {
        timestamp: Some(1_700_000_000),
        mute_action: Some(MuteAction {
            muted: Some(true),
            mute_end_timestamp: Some(-1),
        }),
        ..Default::default()
    }
}

/// A server answering app-state queries from `history`.
async fn served(history: Arc<MemoryPatchSource>) -> (AppStateSync, Arc<MemorySink>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server_handlers = EventHandlers::new().on_node(move |node| {
        let _ = tx.send(node.clone());
    });
    let (client, server) = connect_pair(Relay::default(), EventHandlers::new(), server_handlers).await;
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let id = request.get_attr_str("id").unwrap_or_default().to_string();
            let collection = request
                .get_child_by_tag("sync")
                .and_then(|s| s.get_child_by_tag("collection"))
                .unwrap();
            let name: Collection = collection.get_attr_str("name").unwrap().parse().unwrap();
            let since = collection.get_attr_i64("version").unwrap() as u64;
            let snapshot = collection.get_attr_str("return_snapshot") == Some("true");
            let page = history.fetch(name, since, snapshot).await.unwrap();
            server.send_node(&build_sync_response(name, &id, &page)).await.unwrap();
        }
    });

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
    let sink = Arc::new(MemorySink::new());
    let engine = AppStateSync::new(store, Arc::new(NodePatchSource::new(client)), sink.clone(), EventHandlers::new());
    (engine, sink)
}

#[tokio::test]
async fn test_mute_added_then_removed_over_the_wire() {
    let (snapshot, mut remote) =
        build_snapshot(Collection::Regular, KEY_ID, &KEY_DATA, 4, &[(&["pin_v1", "1@s.whatsapp.net"], SyncActionValue::default())])
            .unwrap();
    let history = Arc::new(MemoryPatchSource::new(1));
    history.set_snapshot(snapshot);
    let (engine, sink) = served(history.clone()).await;

    let summary = engine.sync(Collection::Regular).await.unwrap();
    assert_eq!(summary.version, 4);
    let before = engine.state(Collection::Regular).unwrap();

    history.push_patch(
        PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .set(&["mute", "123"], muted())
            .build(&mut remote)
            .unwrap(),
    );
    let summary = engine.sync(Collection::Regular).await.unwrap();
    assert_eq!(summary.version, 5);
    assert!(matches!(
        sink.get(Collection::Regular, &["mute", "123"]).map(|m| m.event),
        Some(AppStateEvent::Mute { muted: true, .. })
    ));

    history.push_patch(
        PatchBuilder::new(Collection::Regular, KEY_ID, &KEY_DATA)
            .remove(&["mute", "123"])
            .build(&mut remote)
            .unwrap(),
    );
    let summary = engine.sync(Collection::Regular).await.unwrap();
    assert_eq!(summary.version, 6);

    let after = engine.state(Collection::Regular).unwrap();
    assert_eq!(after.hash, before.hash);
    assert_eq!(after, remote);
    assert!(sink.get(Collection::Regular, &["mute", "123"]).is_none());
}

#[tokio::test]
async fn test_gap_in_pushed_patches_is_rejected() {
    let (snapshot, mut remote) = build_snapshot(Collection::RegularLow, KEY_ID, &KEY_DATA, 1, &[]).unwrap();
    let history = Arc::new(MemoryPatchSource::new(10));
    history.set_snapshot(snapshot);
    let (engine, sink) = served(history).await;
    engine.sync(Collection::RegularLow).await.unwrap();
    let before = engine.state(Collection::RegularLow).unwrap();

    let _v2 = PatchBuilder::new(Collection::RegularLow, KEY_ID, &KEY_DATA)
        .set(&["mute", "1"], muted())
        .build(&mut remote)
        .unwrap();
    let v3 = PatchBuilder::new(Collection::RegularLow, KEY_ID, &KEY_DATA)
        .set(&["mute", "2"], muted())
        .build(&mut remote)
        .unwrap();

    assert_eq!(
        engine.handle_patches(Collection::RegularLow, &[v3]).await,
        Err(SyncError::VersionMismatch { current: 1, got: 3 })
    );
    assert_eq!(engine.state(Collection::RegularLow).unwrap(), before);
    assert_eq!(sink.len(Collection::RegularLow), 0);
}
