//! Integration tests for end-to-end WebSocket synchronization.
//!
//! These start a real server and connect real clients, verifying the full
//! pipeline: handshake, bootstrap, live diffs, and persistence.

use std::time::Duration;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use easel_store::{
    PageProps, Record, RecordId, RecordProps, RecordType, ShapeKind, ShapeProps, StoreSchema,
};
use easel_sync::{ClientEvent, ServerConfig, SyncClient, SyncServer};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_test_server(storage: Option<std::path::PathBuf>) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
        presence_timeout_secs: 60,
        storage_path: storage,
    };
    let server = SyncServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the server time to bind.
    sleep(Duration::from_millis(50)).await;
    port
}

fn page_record() -> Record {
    Record::new(
        RecordId::new(RecordType::Page, "p1"),
        2,
        RecordProps::Page(PageProps {
            name: "Page 1".into(),
            index: 0,
        }),
    )
}

fn shape_record(key: &str, x: f64) -> Record {
    Record::new(
        RecordId::new(RecordType::Shape, key),
        2,
        RecordProps::Shape(ShapeProps {
            page: RecordId::new(RecordType::Page, "p1"),
            parent: None,
            x,
            y: 0.0,
            rotation: 0.0,
            opacity: 1.0,
            geo: ShapeKind::Rect { w: 10.0, h: 10.0 },
            asset: None,
        }),
    )
}

async fn connect_live(
    n: u128,
    doc: Uuid,
    url: &str,
) -> (SyncClient, tokio::sync::mpsc::Receiver<ClientEvent>) {
    let mut client = SyncClient::new(Uuid::from_u128(n), doc, StoreSchema::canvas(), url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    // Wait for the bootstrap to finish.
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for Live")
            .expect("event channel closed");
        if matches!(event, ClientEvent::Live) {
            break;
        }
    }
    (client, events)
}

#[tokio::test]
async fn test_client_bootstraps_to_live() {
    let port = start_test_server(None).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc = Uuid::new_v4();

    let (client, _events) = connect_live(1, doc, &url).await;
    let session = client.session();
    let session = session.lock().await;
    assert_eq!(session.server_epoch(), 0);
    assert!(session.store().is_empty());
}

#[tokio::test]
async fn test_edit_replicates_between_clients() {
    let port = start_test_server(None).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc = Uuid::new_v4();

    let (alice, mut alice_events) = connect_live(1, doc, &url).await;
    let (bob, mut bob_events) = connect_live(2, doc, &url).await;

    alice
        .mutate(|txn| {
            txn.put(page_record());
            txn.put(shape_record("s1", 42.0));
            Ok(())
        })
        .await
        .unwrap();

    // Bob receives the diff.
    let event = timeout(Duration::from_secs(2), async {
        loop {
            match bob_events.recv().await {
                Some(ClientEvent::RemoteDiff(diff)) => break diff,
                Some(_) => continue,
                None => panic!("bob's event channel closed"),
            }
        }
    })
    .await
    .expect("bob never saw the diff");
    assert_eq!(event.added.len(), 2);

    // Alice receives her own resolved diff back and clears the push.
    timeout(Duration::from_secs(2), async {
        loop {
            match alice_events.recv().await {
                Some(ClientEvent::RemoteDiff(_)) => break,
                Some(_) => continue,
                None => panic!("alice's event channel closed"),
            }
        }
    })
    .await
    .expect("alice never saw her resolved diff");

    let bob_session = bob.session();
    let bob_session = bob_session.lock().await;
    assert!(bob_session
        .store()
        .contains(&RecordId::new(RecordType::Shape, "s1")));

    let alice_session = alice.session();
    let alice_session = alice_session.lock().await;
    assert_eq!(alice_session.pending_len(), 0);
    assert_eq!(alice_session.server_epoch(), bob_session.server_epoch());
}

#[tokio::test]
async fn test_document_survives_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().join("docs");
    let doc = Uuid::new_v4();

    {
        let port = start_test_server(Some(storage.clone())).await;
        let url = format!("ws://127.0.0.1:{port}");
        let (alice, mut alice_events) = connect_live(1, doc, &url).await;
        alice
            .mutate(|txn| {
                txn.put(page_record());
                txn.put(shape_record("s1", 7.0));
                Ok(())
            })
            .await
            .unwrap();
        // Wait for the resolved diff so the push definitely reached the
        // server before we drop the connection.
        timeout(Duration::from_secs(2), async {
            loop {
                match alice_events.recv().await {
                    Some(ClientEvent::RemoteDiff(_)) => break,
                    Some(_) => continue,
                    None => panic!("alice's event channel closed"),
                }
            }
        })
        .await
        .expect("push never resolved");
        drop(alice);
        // Let the server notice the disconnect and persist the snapshot.
        sleep(Duration::from_millis(200)).await;
    }

    // A new server over the same storage serves the persisted document.
    let port = start_test_server(Some(storage)).await;
    let url = format!("ws://127.0.0.1:{port}");
    let (bob, _events) = connect_live(2, doc, &url).await;
    let session = bob.session();
    let session = session.lock().await;
    assert!(session
        .store()
        .contains(&RecordId::new(RecordType::Shape, "s1")));
    assert!(session
        .store()
        .contains(&RecordId::new(RecordType::Page, "p1")));
}
