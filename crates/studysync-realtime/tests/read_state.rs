mod common;

use common::{client_for, post, setup_backend, within};
use studysync_realtime::{Merge, StreamUpdate, SyncError, SyncSettings};
use studysync_store::RowStore;

async fn three_unread(backend: &common::FlakyBackend) {
    backend
        .sqlite()
        .create_conversation("c1", ["alice", "bob"])
        .await
        .expect("create conversation failed");
    for body in ["one", "two", "three"] {
        post(backend, "c1", "bob", body).await;
    }
}

#[tokio::test]
async fn mark_read_clears_every_observed_unread_message() {
    let (_dir, backend) = setup_backend();
    three_unread(&backend).await;
    let client = client_for(&backend, "alice", SyncSettings::default());
    let mut stream = client.open_conversation("c1").await.expect("open failed");
    assert_eq!(stream.unread_count(), 3);

    assert_eq!(stream.mark_read().await.expect("mark read failed"), 3);
    assert_eq!(stream.unread_count(), 0);
    assert!(stream.messages().iter().all(|m| m.is_read));

    // The store echoes each update; they change nothing locally.
    for _ in 0..3 {
        match within(stream.next()).await {
            Some(StreamUpdate::Merged(Merge::Ignored)) => {}
            other => panic!("expected the read echo to be ignored, got {:?}", other),
        }
    }

    assert_eq!(stream.mark_read().await.expect("second mark read failed"), 0);
    let summary = backend
        .conversation_summary("c1", "alice")
        .await
        .expect("summary failed");
    assert_eq!(summary.unread_count, 0);
}

#[tokio::test]
async fn failed_mark_read_restores_unread_state() {
    let (_dir, backend) = setup_backend();
    three_unread(&backend).await;
    let client = client_for(&backend, "alice", SyncSettings::default());
    let mut stream = client.open_conversation("c1").await.expect("open failed");

    backend.set_offline(true);
    let err = stream.mark_read().await.expect_err("mark read should fail offline");
    assert!(matches!(err, SyncError::WriteFailure { op: "mark_read", .. }));
    assert_eq!(stream.unread_count(), 3);

    backend.set_offline(false);
    assert_eq!(stream.mark_read().await.expect("retry failed"), 3);
}

#[tokio::test]
async fn mark_read_leaves_unseen_messages_unread() {
    let (_dir, backend) = setup_backend();
    three_unread(&backend).await;
    let client = client_for(&backend, "alice", SyncSettings::default());
    let mut stream = client.open_conversation("c1").await.expect("open failed");

    let late = post(&backend, "c1", "bob", "four").await;
    assert_eq!(stream.mark_read().await.expect("mark read failed"), 3);

    match within(stream.next()).await {
        Some(StreamUpdate::Merged(Merge::Inserted(id))) => assert_eq!(id, late.id),
        other => panic!("expected the late message, got {:?}", other),
    }
    assert_eq!(stream.unread_count(), 1);
    let summary = backend
        .conversation_summary("c1", "alice")
        .await
        .expect("summary failed");
    assert_eq!(summary.unread_count, 1);
}

#[tokio::test]
async fn own_messages_never_count_as_unread() {
    let (_dir, backend) = setup_backend();
    backend
        .sqlite()
        .create_conversation("c1", ["alice", "bob"])
        .await
        .expect("create conversation failed");
    post(&backend, "c1", "alice", "hi bob").await;
    let client = client_for(&backend, "alice", SyncSettings::default());
    let mut stream = client.open_conversation("c1").await.expect("open failed");

    assert_eq!(stream.unread_count(), 0);
    assert_eq!(stream.mark_read().await.expect("mark read failed"), 0);
}
