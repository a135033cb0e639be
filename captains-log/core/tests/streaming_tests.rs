//! End-to-end streaming between a producer and a viewer
//!
//! Both sides run in-process over [`MemoryDirectory`] with real TLS, so
//! these tests cover discovery, the pinned handshake, replay and resumption
//! exactly as they happen on the network.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::task::JoinSet;

use captains_log_core::{
    CursorStore, ErrorKind, LastItemId, MemoryDirectory, ProducerEvent, ServerEvent,
};

use common::*;

#[tokio::test]
async fn test_items_stream_and_resume_after_reconnect() {
    let directory = MemoryDirectory::new();
    let authority = SeedAuthority::new(SEED_ID);

    let (viewer, mut viewer_events) =
        start_viewer(&directory, &authority, "Desk", CursorStore::new()).await;
    let (producer, mut producer_events) = start_producer(&directory, &authority, run("app-1"));

    assert_eq!(wait_connected(&mut producer_events).await, 0);
    producer.log(item("1"));
    producer.log(item("2"));
    assert_eq!(ids(&receive_items(&mut viewer_events, 2).await), vec!["1", "2"]);

    producer.disconnect_all();
    wait_for(&mut producer_events, |event| {
        matches!(event, ProducerEvent::Disconnected { .. }).then_some(())
    })
    .await;
    assert_eq!(wait_connected(&mut producer_events).await, 0);

    producer.log(item("3"));
    assert_eq!(ids(&receive_items(&mut viewer_events, 1).await), vec!["3"]);
    assert_quiet(&mut viewer_events).await;
    assert_eq!(viewer.last_item_id("app-1"), LastItemId::Assigned("3".into()));

    producer.shutdown().await;
    viewer.shutdown().await;
}

#[tokio::test]
async fn test_history_and_live_items_arrive_in_order() {
    let directory = MemoryDirectory::new();
    let authority = SeedAuthority::new(SEED_ID);

    let (producer, mut producer_events) = start_producer(&directory, &authority, run("app-1"));
    for i in 1..=50 {
        producer.log(item(i.to_string()));
    }

    let (viewer, mut viewer_events) =
        start_viewer(&directory, &authority, "Desk", CursorStore::new()).await;
    assert_eq!(wait_connected(&mut producer_events).await, 50);

    for i in 51..=100 {
        producer.log(item(i.to_string()));
    }

    let expected: Vec<String> = (1..=100).map(|i| i.to_string()).collect();
    assert_eq!(ids(&receive_items(&mut viewer_events, 100).await), expected);

    producer.shutdown().await;
    viewer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loggers_keep_per_caller_order() {
    let directory = MemoryDirectory::new();
    let authority = SeedAuthority::new(SEED_ID);

    let (viewer, mut viewer_events) =
        start_viewer(&directory, &authority, "Desk", CursorStore::new()).await;
    let (producer, mut producer_events) = start_producer(&directory, &authority, run("app-1"));
    wait_connected(&mut producer_events).await;

    let producer = Arc::new(producer);
    let mut workers = JoinSet::new();
    for worker in 0..4 {
        let producer = Arc::clone(&producer);
        workers.spawn(async move {
            for i in 0..25 {
                producer.log(item(format!("w{worker}-{i}")));
                if i % 5 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
    }
    while let Some(result) = workers.join_next().await {
        result.unwrap();
    }

    let received = ids(&receive_items(&mut viewer_events, 100).await);
    for worker in 0..4 {
        let prefix = format!("w{worker}-");
        let sequence: Vec<String> = received
            .iter()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect();
        let expected: Vec<String> = (0..25).map(|i| format!("w{worker}-{i}")).collect();
        assert_eq!(sequence, expected);
    }

    producer.shutdown().await;
    viewer.shutdown().await;
}

#[tokio::test]
async fn test_viewer_drop_resumes_from_last_received_item() {
    let directory = MemoryDirectory::new();
    let authority = SeedAuthority::new(SEED_ID);

    let (viewer, mut viewer_events) =
        start_viewer(&directory, &authority, "Desk", CursorStore::new()).await;
    let (producer, mut producer_events) = start_producer(&directory, &authority, run("app-1"));
    wait_connected(&mut producer_events).await;

    for i in 1..=6 {
        producer.log(item(i.to_string()));
    }
    receive_items(&mut viewer_events, 6).await;

    assert!(viewer.disconnect("app-1"));
    wait_for(&mut producer_events, |event| {
        matches!(event, ProducerEvent::Disconnected { .. }).then_some(())
    })
    .await;

    for i in 7..=10 {
        producer.log(item(i.to_string()));
    }

    let received = ids(&receive_items(&mut viewer_events, 4).await);
    assert_eq!(received, vec!["7", "8", "9", "10"]);
    assert_quiet(&mut viewer_events).await;
    assert_eq!(viewer.last_item_id("app-1"), LastItemId::Assigned("10".into()));

    producer.shutdown().await;
    viewer.shutdown().await;
}

#[tokio::test]
async fn test_unknown_cursor_replays_full_history() {
    let directory = MemoryDirectory::new();
    let authority = SeedAuthority::new(SEED_ID);

    let (producer, mut producer_events) = start_producer(&directory, &authority, run("app-1"));
    for i in 1..=3 {
        producer.log(item(i.to_string()));
    }

    let cursors = CursorStore::new();
    cursors.record("app-1", "ghost");
    let (viewer, mut viewer_events) = start_viewer(&directory, &authority, "Desk", cursors).await;

    assert_eq!(wait_connected(&mut producer_events).await, 3);
    assert_eq!(ids(&receive_items(&mut viewer_events, 3).await), vec!["1", "2", "3"]);

    producer.shutdown().await;
    viewer.shutdown().await;
}

#[tokio::test]
async fn test_viewer_with_untrusted_identity_is_refused() {
    let directory = MemoryDirectory::new();
    let trusted = SeedAuthority::new(SEED_ID);
    let rogue = SeedAuthority::new(SEED_ID);

    let (viewer, mut viewer_events) =
        start_viewer(&directory, &rogue, "Impostor", CursorStore::new()).await;
    let (producer, mut producer_events) = start_producer(&directory, &trusted, run("app-1"));
    producer.log(item("secret"));

    let kind = wait_for(&mut producer_events, |event| match event {
        ProducerEvent::PeerFailed { kind, .. } => Some(kind),
        ProducerEvent::Connected { .. } => panic!("connected to an untrusted viewer"),
        _ => None,
    })
    .await;
    assert_eq!(kind, ErrorKind::Security);
    assert!(producer.connected_viewers().is_empty());

    wait_for(&mut viewer_events, |event| match event {
        ServerEvent::ConnectionFailed { .. } => Some(()),
        ServerEvent::ItemReceived { .. } => panic!("item leaked to an untrusted viewer"),
        _ => None,
    })
    .await;

    producer.shutdown().await;
    viewer.shutdown().await;
}

#[tokio::test]
async fn test_viewer_advertising_another_seed_is_skipped() {
    let directory = MemoryDirectory::new();
    let authority = SeedAuthority::new(SEED_ID);

    let identities = captains_log_core::StaticIdentityProvider::new()
        .with_identity("other-seed", authority.issue("Other"));
    let security = captains_log_core::IdentityPresentingSecurity::new(Arc::new(identities));
    let config = captains_log_core::ServerConfig::new("Other", "other-seed").with_port(0);
    let (viewer, _viewer_events) =
        captains_log_core::CaptainsLogServer::start(&directory, Arc::new(security), config)
            .await
            .unwrap();

    let (producer, mut producer_events) = start_producer(&directory, &authority, run("app-1"));

    let outcome = tokio::time::timeout(Duration::from_millis(500), producer_events.recv()).await;
    assert!(outcome.is_err(), "producer reacted to a foreign viewer: {outcome:?}");
    assert!(producer.connected_viewers().is_empty());

    producer.shutdown().await;
    viewer.shutdown().await;
}

#[tokio::test]
async fn test_producer_shutdown_ends_viewer_link() {
    let directory = MemoryDirectory::new();
    let authority = SeedAuthority::new(SEED_ID);

    let (viewer, mut viewer_events) =
        start_viewer(&directory, &authority, "Desk", CursorStore::new()).await;
    let (producer, mut producer_events) = start_producer(&directory, &authority, run("app-1"));
    wait_connected(&mut producer_events).await;

    wait_for(&mut viewer_events, |event| {
        matches!(event, ServerEvent::ConnectionEstablished { .. }).then_some(())
    })
    .await;
    assert_eq!(viewer.active_producers().len(), 1);

    producer.shutdown().await;

    let producer_id = wait_for(&mut viewer_events, |event| match event {
        ServerEvent::ConnectionLost { producer_id, .. } => Some(producer_id),
        _ => None,
    })
    .await;
    assert_eq!(producer_id, "app-1");
    assert!(viewer.active_producers().is_empty());

    viewer.shutdown().await;
}
