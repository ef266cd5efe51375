#![allow(clippy::unwrap_used)]
// Integration tests for the bus-master registry: uniqueness,
// replay-on-subscribe, ordered delivery, unsubscribe semantics.

mod common;

use futures_util::StreamExt;
use pretty_assertions::assert_eq;
use tokio_test::assert_ok;

use owlink_core::{BusMaster, BusMasterRegistry, RegistryError};

use common::{started_master, MockTransport, RecordingObserver};

#[tokio::test]
async fn add_rejects_duplicates() {
    let registry = BusMasterRegistry::new();
    let (_, master) = started_master("serial-0");

    registry.add(master.clone()).await.unwrap();
    let err = registry.add(master).await.unwrap_err();
    assert_eq!(
        err,
        RegistryError::AlreadyRegistered {
            name: "serial-0".into()
        }
    );
}

#[tokio::test]
async fn remove_rejects_unknown() {
    let registry = BusMasterRegistry::new();
    let (_, master) = started_master("serial-0");

    let err = registry.remove(&master).await.unwrap_err();
    assert_eq!(
        err,
        RegistryError::NotRegistered {
            name: "serial-0".into()
        }
    );
}

#[tokio::test]
async fn add_rejects_unstarted_and_unnamed() {
    let registry = BusMasterRegistry::new();

    let stopped = BusMaster::new(MockTransport::new("serial-1"));
    assert_eq!(
        registry.add(stopped).await.unwrap_err(),
        RegistryError::NotStarted {
            name: "serial-1".into()
        }
    );

    let unnamed = BusMaster::new(MockTransport::started(""));
    assert_eq!(
        registry.add(unnamed).await.unwrap_err(),
        RegistryError::Unnamed
    );
}

#[tokio::test]
async fn subscribe_replays_existing_members_in_order() {
    let registry = BusMasterRegistry::new();
    let (_, b1) = started_master("serial-1");
    let (_, b2) = started_master("serial-2");
    registry.add(b1).await.unwrap();
    registry.add(b2).await.unwrap();

    let observer = RecordingObserver::new();
    let _sub = registry.subscribe(observer.clone()).await;

    // The replay completes before subscribe returns.
    assert_eq!(
        observer.snapshot(),
        vec![("serial-1".to_owned(), true), ("serial-2".to_owned(), true)]
    );
}

#[tokio::test]
async fn events_after_subscribe_arrive_in_order() {
    let registry = BusMasterRegistry::new();
    let (_, b1) = started_master("serial-1");
    registry.add(b1.clone()).await.unwrap();

    let observer = RecordingObserver::new();
    let _sub = registry.subscribe(observer.clone()).await;

    let (_, b2) = started_master("serial-2");
    registry.add(b2).await.unwrap();
    registry.remove(&b1).await.unwrap();

    observer.wait_for_events(3).await;
    assert_eq!(
        observer.snapshot(),
        vec![
            ("serial-1".to_owned(), true),
            ("serial-2".to_owned(), true),
            ("serial-1".to_owned(), false),
        ]
    );
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let registry = BusMasterRegistry::new();
    let observer = RecordingObserver::new();
    let sub = registry.subscribe(observer.clone()).await;

    sub.unsubscribe();
    // Give the dispatch task a chance to observe the cancellation.
    tokio::task::yield_now().await;

    let (_, master) = started_master("serial-1");
    registry.add(master).await.unwrap();

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(observer.snapshot(), Vec::<(String, bool)>::new());
}

#[tokio::test]
async fn snapshot_and_lookup_reflect_membership() {
    let registry = BusMasterRegistry::new();
    assert!(registry.snapshot().is_empty());

    let (_, master) = started_master("serial-1");
    assert_ok!(registry.add(master.clone()).await);

    let snap = registry.snapshot();
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].name(), "serial-1");
    assert!(registry.get("serial-1").await.is_some());
    assert!(registry.get("serial-9").await.is_none());

    registry.remove(&master).await.unwrap();
    assert!(registry.snapshot().is_empty());
}

#[tokio::test]
async fn stream_observes_membership_changes() {
    let registry = BusMasterRegistry::new();
    let mut stream = registry.stream();
    assert!(stream.current().is_empty());

    let (_, master) = started_master("serial-1");
    registry.add(master).await.unwrap();

    let snap = stream.changed().await.unwrap();
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].name(), "serial-1");

    // Dropping every registry handle ends the stream.
    let sender_gone = {
        drop(registry);
        stream.changed().await.is_none()
    };
    assert!(sender_gone);
}

#[tokio::test]
async fn into_stream_yields_snapshots() {
    let registry = BusMasterRegistry::new();
    let mut snapshots = registry.stream().into_stream();

    // The watch adapter yields the current value first.
    let initial = snapshots.next().await.unwrap();
    assert!(initial.is_empty());

    let (_, master) = started_master("serial-1");
    assert_ok!(registry.add(master).await);

    let next = snapshots.next().await.unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].name(), "serial-1");
}
