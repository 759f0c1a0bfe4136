use std::sync::Arc;

use whatsapp_engine::crypto::PreKey;
use whatsapp_engine::signal::{Ciphertext, MemoryDirectory, PreKeyBundle, SessionError, SessionManager};
use whatsapp_engine::store::{MemoryStore, PreKeyStore};
use whatsapp_engine::types::DeviceAddress;
use whatsapp_engine::EngineConfig;

struct Peer {
    address: DeviceAddress,
    store: Arc<MemoryStore>,
    manager: SessionManager,
}

fn peers() -> (Peer, Peer) {
    let directory = Arc::new(MemoryDirectory::new());
    let make = |user: &str, pre_key_id: u32| {
        let store = Arc::new(MemoryStore::generate());
        let address = DeviceAddress::new(user, 0);
        let bundle = PreKeyBundle::from_store(
            store.as_ref(),
            &store.device().signed_pre_key,
            Some(&PreKey::new(pre_key_id)),
        )
        .unwrap();
        directory.publish(address.clone(), bundle);
        let manager = SessionManager::new(store.clone(), directory.clone(), &EngineConfig::default());
        Peer {
            address,
            store,
            manager,
        }
    };
    (make("15550001", 1), make("15550002", 2))
}

#[tokio::test]
async fn test_bootstrap_then_out_of_order_delivery() {
    let (alice, bob) = peers();

    let mut sent = Vec::new();
    for text in ["one", "two", "three"] {
        sent.push(alice.manager.encrypt(&bob.address, text.as_bytes()).await.unwrap());
    }
    assert!(sent.iter().all(|c| matches!(c, Ciphertext::PreKey(_))));

    assert_eq!(bob.manager.decrypt(&alice.address, &sent[2]).await.unwrap(), b"three");
    assert_eq!(bob.store.pre_key_count().unwrap(), 0);
    assert_eq!(bob.manager.decrypt(&alice.address, &sent[0]).await.unwrap(), b"one");
    assert_eq!(bob.manager.decrypt(&alice.address, &sent[1]).await.unwrap(), b"two");

    assert!(matches!(
        bob.manager.decrypt(&alice.address, &sent[0]).await,
        Err(SessionError::DuplicateMessage { .. })
    ));

    // The reply ends the pre-key phase on Alice's side.
    let reply = bob.manager.encrypt(&alice.address, b"got them").await.unwrap();
    assert!(matches!(reply, Ciphertext::Whisper(_)));
    assert_eq!(alice.manager.decrypt(&bob.address, &reply).await.unwrap(), b"got them");
    let next = alice.manager.encrypt(&bob.address, b"four").await.unwrap();
    assert!(matches!(next, Ciphertext::Whisper(_)));
    assert_eq!(bob.manager.decrypt(&alice.address, &next).await.unwrap(), b"four");
}

#[tokio::test]
async fn test_sessions_survive_reload_from_store() {
    let (alice, bob) = peers();
    let first = alice.manager.encrypt(&bob.address, b"hello").await.unwrap();
    bob.manager.decrypt(&alice.address, &first).await.unwrap();

    let reloaded = SessionManager::new(
        bob.store.clone(),
        Arc::new(MemoryDirectory::new()),
        &EngineConfig::default(),
    );
    let reply = reloaded.encrypt(&alice.address, b"from disk").await.unwrap();
    assert_eq!(alice.manager.decrypt(&bob.address, &reply).await.unwrap(), b"from disk");
}

#[tokio::test]
async fn test_concurrent_encrypts_to_one_address_stay_ordered() {
    let (alice, bob) = peers();
    let alice = Arc::new(alice);
    let first = alice.manager.encrypt(&bob.address, b"warmup").await.unwrap();
    bob.manager.decrypt(&alice.address, &first).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let alice = alice.clone();
            let to = bob.address.clone();
            tokio::spawn(async move { alice.manager.encrypt(&to, format!("m{i}").as_bytes()).await })
        })
        .collect();
    let mut ciphertexts = Vec::new();
    for task in tasks {
        ciphertexts.push(task.await.unwrap().unwrap());
    }
    // Every message used a distinct chain position, so all decrypt in any order.
    for ciphertext in ciphertexts.iter().rev() {
        bob.manager.decrypt(&alice.address, ciphertext).await.unwrap();
    }
}
