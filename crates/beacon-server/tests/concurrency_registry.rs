//! Concurrency tests for the gateway ConnectionRegistry.
//!
//! These verify that concurrent join/leave/broadcast calls neither deadlock
//! nor leave orphaned subject entries, and that one slow or dead peer never
//! affects delivery to the others.

use beacon_server::api_ws::ConnectionRegistry;
use beacon_types::SubjectId;
use std::sync::Arc;
use tokio::sync::mpsc;

fn subject(name: &str) -> SubjectId {
    name.parse().unwrap()
}

#[tokio::test]
async fn test_concurrent_join_leave_no_orphans() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut handles = Vec::new();

    for i in 0..200 {
        let registry = registry.clone();
        let subject = subject(&format!("proj-{}", i % 7));
        handles.push(tokio::spawn(async move {
            let (tx, _rx) = mpsc::channel::<String>(4);
            let id = registry.join(&subject, tx);
            registry.broadcast(&subject, Some(id), "frame".to_string());
            registry.leave(&subject, id);
        }));
    }

    for handle in handles {
        handle.await.expect("task should not panic");
    }

    assert_eq!(registry.subject_count(), 0);
}

#[test]
fn test_reclaim_never_drops_a_peer_that_just_joined() {
    let registry = ConnectionRegistry::new();
    let subject = subject("proj-churn");

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let subject = subject.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let (tx, _rx) = mpsc::channel::<String>(4);
                    let id = registry.join(&subject, tx);
                    // Our own peer must stay reachable until we leave.
                    assert!(registry.peer_count(&subject) >= 1);
                    assert!(registry.broadcast(&subject, None, "ping".to_string()).delivered >= 1);
                    registry.leave(&subject, id);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker should not panic");
    }

    assert_eq!(registry.peer_count(&subject), 0);
    assert_eq!(registry.subject_count(), 0);
}

#[test]
fn test_leave_keeps_subject_while_peers_remain() {
    let registry = ConnectionRegistry::new();
    let busy = subject("proj-busy");
    let quiet = subject("proj-quiet");

    let (anchor_tx, mut anchor_rx) = mpsc::channel::<String>(1000);
    registry.join(&busy, anchor_tx);
    let (quiet_tx, _quiet_rx) = mpsc::channel::<String>(1000);
    let quiet_id = registry.join(&quiet, quiet_tx);

    let churn: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            let busy = busy.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let (tx, _rx) = mpsc::channel::<String>(1);
                    let id = registry.join(&busy, tx);
                    registry.leave(&busy, id);
                }
            })
        })
        .collect();
    for n in 0..200 {
        registry.broadcast(&busy, None, format!("m{n}"));
    }
    for worker in churn {
        worker.join().expect("worker should not panic");
    }

    assert_eq!(registry.peer_count(&busy), 1);
    let mut received = 0;
    while anchor_rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 200);

    registry.leave(&quiet, quiet_id);
    assert_eq!(registry.subject_count(), 1);
}

#[tokio::test]
async fn test_concurrent_broadcasts_reach_every_peer() {
    let registry = ConnectionRegistry::new();
    let subject = subject("proj-1");

    let mut receivers = Vec::new();
    for _ in 0..5 {
        let (tx, rx) = mpsc::channel::<String>(1000);
        registry.join(&subject, tx);
        receivers.push(rx);
    }

    let mut handles = Vec::new();
    for task in 0..10 {
        let registry = registry.clone();
        let subject = subject.clone();
        handles.push(tokio::spawn(async move {
            for n in 0..50 {
                let report = registry.broadcast(&subject, None, format!("{task}-{n}"));
                assert_eq!(report.delivered, 5);
            }
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    for mut rx in receivers {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 500);
    }
}

#[tokio::test]
async fn test_full_queue_drops_frame_without_removing_peer() {
    let registry = ConnectionRegistry::new();
    let subject = subject("proj-1");

    let (slow_tx, mut slow_rx) = mpsc::channel::<String>(1);
    let (fast_tx, mut fast_rx) = mpsc::channel::<String>(16);
    registry.join(&subject, slow_tx);
    registry.join(&subject, fast_tx);

    let first = registry.broadcast(&subject, None, "one".to_string());
    assert_eq!(first.delivered, 2);

    let second = registry.broadcast(&subject, None, "two".to_string());
    assert_eq!(second.delivered, 1);
    assert_eq!(second.lagging, 1);
    assert_eq!(second.removed, 0);
    assert_eq!(registry.peer_count(&subject), 2);

    assert_eq!(slow_rx.recv().await.as_deref(), Some("one"));
    assert!(slow_rx.try_recv().is_err());
    assert_eq!(fast_rx.recv().await.as_deref(), Some("one"));
    assert_eq!(fast_rx.recv().await.as_deref(), Some("two"));

    // Once drained, the slow peer receives again.
    registry.broadcast(&subject, None, "three".to_string());
    assert_eq!(slow_rx.recv().await.as_deref(), Some("three"));
}

#[tokio::test]
async fn test_closed_peer_is_removed_during_broadcast() {
    let registry = ConnectionRegistry::new();
    let subject = subject("proj-1");

    let (dead_tx, dead_rx) = mpsc::channel::<String>(4);
    let (live_tx, mut live_rx) = mpsc::channel::<String>(4);
    registry.join(&subject, dead_tx);
    registry.join(&subject, live_tx);
    drop(dead_rx);

    let report = registry.broadcast(&subject, None, "hello".to_string());
    assert_eq!(report.delivered, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(registry.peer_count(&subject), 1);
    assert_eq!(live_rx.recv().await.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_broadcast_excludes_origin() {
    let registry = ConnectionRegistry::new();
    let subject = subject("proj-1");

    let (origin_tx, mut origin_rx) = mpsc::channel::<String>(4);
    let (other_tx, mut other_rx) = mpsc::channel::<String>(4);
    let origin = registry.join(&subject, origin_tx);
    registry.join(&subject, other_tx);

    let report = registry.broadcast(&subject, Some(origin), "event".to_string());
    assert_eq!(report.delivered, 1);
    assert!(origin_rx.try_recv().is_err());
    assert_eq!(other_rx.recv().await.as_deref(), Some("event"));
}

#[tokio::test]
async fn test_broadcast_to_unknown_subject_is_a_no_op() {
    let registry = ConnectionRegistry::new();
    let report = registry.broadcast(&subject("nobody"), None, "event".to_string());
    assert_eq!(report.delivered, 0);
    assert_eq!(registry.subject_count(), 0);
}
