//! Durable backend tests: the RocksDB change log and checkpoint store.

use docsync::client::{Stores, SyncClient, Transaction};
use docsync::config::{CheckpointTrigger, SyncConfig};
use docsync::engine::text::{TextEngine, TextStep};
use docsync::protocol::{Checkpoint, ClientData, ClientId, LogKey, Metadata, NewEntry};
use docsync::store::{
    ChangeLog, CheckpointStore, MemoryPresenceHub, RocksDocument, RocksStore, StoreConfig,
};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

type Client = SyncClient<TextEngine, RocksDocument, RocksDocument, docsync::PresenceConnection>;

fn new_entry(origin: &str, payload: &[u8]) -> NewEntry {
    NewEntry {
        operations: vec![payload.to_vec()],
        origin: ClientId::new(origin),
        metadata: Metadata::new(),
    }
}

async fn client(doc: &RocksDocument, hub: &MemoryPresenceHub, id: &str, config: SyncConfig) -> Client {
    let doc = Arc::new(doc.clone());
    let stores = Stores::new(Arc::clone(&doc), doc, Arc::new(hub.connect().await));
    SyncClient::new(config, TextEngine::new(ClientId::new(id)), stores, ClientData::named(id))
}

async fn wait_for_key(client: &Client, key: LogKey) {
    let reached = timeout(Duration::from_secs(5), async {
        while client.status().await.unwrap().most_recent_key < key {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "never reached key {key}");
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let doc_id = Uuid::new_v4();

    {
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        let doc = store.document(doc_id);
        for key in 1..=3 {
            doc.try_claim(key, new_entry("a", &[key as u8; 16])).await.unwrap();
        }
        doc.write(Checkpoint { snapshot: b"snap".to_vec(), key: 2, write_timestamp: 0 })
            .await
            .unwrap();
        store.sync().unwrap();
    }

    let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
    let doc = store.document(doc_id);
    let entries = doc.read_range(0).await.unwrap();
    assert_eq!(entries.iter().map(|e| e.key).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(entries[2].operations, vec![vec![3u8; 16]]);
    assert_eq!(doc.read_latest().await.unwrap().unwrap().key, 2);

    let meta = store.metadata(doc_id).unwrap().unwrap();
    assert_eq!(meta.latest_key, 3);
    assert_eq!(meta.checkpoint_key, Some(2));
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let doc = store.document(Uuid::new_v4());

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let doc = doc.clone();
        handles.push(tokio::spawn(async move {
            doc.try_claim(1, new_entry(&format!("c{i}"), &[i])).await.unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_committed() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(doc.read_range(0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_subscription_backlog_then_live() {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let doc = store.document(Uuid::new_v4());
    doc.try_claim(1, new_entry("a", b"one")).await.unwrap();
    doc.try_claim(2, new_entry("a", b"two")).await.unwrap();

    let mut sub = doc.subscribe_added(1).await.unwrap();
    doc.try_claim(3, new_entry("b", b"three")).await.unwrap();

    assert_eq!(sub.recv().await.unwrap().key, 2);
    let live = sub.recv().await.unwrap();
    assert_eq!(live.key, 3);
    assert_eq!(live.origin, ClientId::new("b"));
}

#[tokio::test]
async fn test_clients_sync_over_rocks() {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let doc = store.document(Uuid::new_v4());
    let hub = MemoryPresenceHub::new();
    let config = SyncConfig {
        checkpoint: CheckpointTrigger::KeyMultiple(2),
        ..SyncConfig::for_testing()
    };

    let mut alice = client(&doc, &hub, "alice", config.clone()).await;
    let mut bob = client(&doc, &hub, "bob", config.clone()).await;
    alice.attach().await.unwrap();
    bob.attach().await.unwrap();

    alice
        .on_local_change(Transaction::new(vec![TextStep::insert(0, "durable")]))
        .unwrap();
    wait_for_key(&bob, 1).await;
    bob.on_local_change(Transaction::new(vec![TextStep::insert(7, " text")]))
        .unwrap();
    wait_for_key(&alice, 2).await;
    assert_eq!(alice.state().await.unwrap().text(), "durable text");

    let checkpointed = timeout(Duration::from_secs(5), async {
        while doc.read_latest().await.unwrap().is_none() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(checkpointed.is_ok());
    assert_eq!(doc.prune_through(2).await.unwrap(), 2);

    // a new client bootstraps from the checkpoint alone
    let mut carol = client(&doc, &hub, "carol", config).await;
    let state = carol.attach().await.unwrap();
    assert_eq!(state.text(), "durable text");

    alice.detach().await.unwrap();
    bob.detach().await.unwrap();
    carol.detach().await.unwrap();
}
