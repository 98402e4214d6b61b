mod common;

use chrono::Duration as ChronoDuration;
use common::{client_for, setup_backend, within, FlakyBackend};
use serde_json::json;
use studysync_realtime::{CollabChannel, CollabUpdate, ConnectionState, SyncError, SyncSettings};
use studysync_store::collab::CreateSessionParams;
use studysync_store::RowStore;
use studysync_types::{timestamp, AnnotationKind, SubscriptionKey};

async fn seed_session(backend: &FlakyBackend) {
    backend
        .sqlite()
        .create_session(CreateSessionParams {
            id: "s1".to_string(),
            title: "Lab report".to_string(),
            document_content: "draft".to_string(),
            participant_ids: vec!["alice".to_string(), "bob".to_string()],
        })
        .await
        .expect("create session failed");
}

fn content(session: &studysync_realtime::CollabSession<FlakyBackend>) -> String {
    session
        .document()
        .map(|doc| doc.content().to_string())
        .unwrap_or_default()
}

#[tokio::test]
async fn concurrent_saves_converge_on_the_latest_version() {
    let (_dir, backend) = setup_backend();
    seed_session(&backend).await;
    let alice_client = client_for(&backend, "alice", SyncSettings::default());
    let bob_client = client_for(&backend, "bob", SyncSettings::default());
    let mut alice = alice_client.open_collab_session("s1").await.expect("open failed");
    let mut bob = bob_client.open_collab_session("s1").await.expect("open failed");
    assert_eq!(content(&alice), "draft");

    let first = alice.save_content("A".to_string()).await.expect("save failed");
    let second = bob.save_content("B".to_string()).await.expect("save failed");
    assert!(second > first);

    // Alice sees her own echo, then Bob's newer save.
    assert!(matches!(
        within(alice.next()).await,
        Some(CollabUpdate::Ignored(CollabChannel::Content))
    ));
    assert!(matches!(within(alice.next()).await, Some(CollabUpdate::Content)));

    // Bob already holds the newest version; both echoes are stale or equal.
    for _ in 0..2 {
        assert!(matches!(
            within(bob.next()).await,
            Some(CollabUpdate::Ignored(CollabChannel::Content))
        ));
    }

    assert_eq!(content(&alice), "B");
    assert_eq!(content(&bob), "B");
    assert_eq!(alice.document().map(|d| d.version()), Some(second));
    assert_eq!(
        alice.document().and_then(|d| d.updated_by()),
        Some("bob")
    );
}

#[tokio::test]
async fn stale_content_never_overwrites_newer_content() {
    let (_dir, backend) = setup_backend();
    seed_session(&backend).await;
    let client = client_for(&backend, "alice", SyncSettings::default());
    let mut session = client.open_collab_session("s1").await.expect("open failed");

    let saved = session.save_content("A".to_string()).await.expect("save failed");
    assert!(matches!(
        within(session.next()).await,
        Some(CollabUpdate::Ignored(CollabChannel::Content))
    ));

    backend.hub().inject(json!({
        "table": "collab_sessions",
        "eventType": "UPDATE",
        "new": {
            "id": "s1",
            "document_content": "B",
            "updated_at": timestamp::format(&(saved - ChronoDuration::seconds(1))),
            "updated_by": "bob"
        },
        "old": {},
        "errors": null
    }));
    assert!(matches!(
        within(session.next()).await,
        Some(CollabUpdate::Ignored(CollabChannel::Content))
    ));
    assert_eq!(content(&session), "A");
}

#[tokio::test]
async fn annotations_propagate_between_participants() {
    let (_dir, backend) = setup_backend();
    seed_session(&backend).await;
    let alice_client = client_for(&backend, "alice", SyncSettings::default());
    let bob_client = client_for(&backend, "bob", SyncSettings::default());
    let mut alice = alice_client.open_collab_session("s1").await.expect("open failed");
    let mut bob = bob_client.open_collab_session("s1").await.expect("open failed");

    let note = alice
        .add_annotation(AnnotationKind::Highlight, json!({"from": 0, "to": 5}))
        .await
        .expect("add failed");
    assert_eq!(alice.document().map(|d| d.annotations().len()), Some(1));

    assert!(matches!(
        within(alice.next()).await,
        Some(CollabUpdate::Ignored(CollabChannel::Annotations))
    ));
    assert!(matches!(within(bob.next()).await, Some(CollabUpdate::Annotations)));
    assert_eq!(
        bob.document().map(|d| d.annotations()[0].id.clone()),
        Some(note.id.clone())
    );

    bob.delete_annotation(&note.id).await.expect("delete failed");
    assert_eq!(bob.document().map(|d| d.annotations().len()), Some(0));
    assert!(matches!(
        within(bob.next()).await,
        Some(CollabUpdate::Ignored(CollabChannel::Annotations))
    ));
    assert!(matches!(within(alice.next()).await, Some(CollabUpdate::Annotations)));
    assert_eq!(alice.document().map(|d| d.annotations().len()), Some(0));
}

#[tokio::test]
async fn failed_annotation_delete_is_rolled_back() {
    let (_dir, backend) = setup_backend();
    seed_session(&backend).await;
    let client = client_for(&backend, "alice", SyncSettings::default());
    let mut session = client.open_collab_session("s1").await.expect("open failed");

    let first = session
        .add_annotation(AnnotationKind::Comment, json!({"text": "cite this"}))
        .await
        .expect("add failed");
    let second = session
        .add_annotation(AnnotationKind::StickyNote, json!({"text": "todo"}))
        .await
        .expect("add failed");

    backend.set_offline(true);
    let err = session
        .delete_annotation(&first.id)
        .await
        .expect_err("delete should fail offline");
    assert!(matches!(err, SyncError::WriteFailure { op: "delete_annotation", .. }));
    let ids: Vec<String> = session
        .document()
        .map(|d| d.annotations().iter().map(|a| a.id.clone()).collect())
        .unwrap_or_default();
    assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);

    let err = session
        .add_annotation(AnnotationKind::Highlight, json!({}))
        .await
        .expect_err("add should fail offline");
    assert!(matches!(err, SyncError::WriteFailure { op: "add_annotation", .. }));
    assert_eq!(session.document().map(|d| d.annotations().len()), Some(2));
}

#[tokio::test]
async fn deleting_an_already_removed_annotation_succeeds() {
    let (_dir, backend) = setup_backend();
    seed_session(&backend).await;
    let client = client_for(&backend, "alice", SyncSettings::default());
    let mut session = client.open_collab_session("s1").await.expect("open failed");

    let note = session
        .add_annotation(AnnotationKind::Drawing, json!({"path": []}))
        .await
        .expect("add failed");
    backend
        .delete_annotation(&note.id)
        .await
        .expect("direct delete failed");

    session
        .delete_annotation(&note.id)
        .await
        .expect("delete of a missing annotation should succeed");
    assert_eq!(session.document().map(|d| d.annotations().len()), Some(0));
}

#[tokio::test]
async fn reconnect_resyncs_both_keys() {
    let (_dir, backend) = setup_backend();
    seed_session(&backend).await;
    let client = client_for(&backend, "alice", SyncSettings::default());
    let mut session = client.open_collab_session("s1").await.expect("open failed");

    let mut keys: Vec<SubscriptionKey> = client.status().into_iter().map(|s| s.key).collect();
    keys.sort();
    let mut expected = vec![
        SubscriptionKey::CollabContent("s1".to_string()),
        SubscriptionKey::CollabAnnotations("s1".to_string()),
    ];
    expected.sort();
    assert_eq!(keys, expected);

    backend.hub().disconnect_all("network lost");
    assert!(matches!(
        within(session.next()).await,
        Some(CollabUpdate::Reconnecting(SyncError::TransientConnection { .. }))
    ));
    assert_eq!(session.connection(), ConnectionState::Reconnecting);

    backend
        .sqlite()
        .save_content("s1", "bob", "edited offline".to_string())
        .await
        .expect("save failed");
    session.reconnect().await.expect("reconnect failed");

    assert_eq!(session.connection(), ConnectionState::Connected);
    assert_eq!(content(&session), "edited offline");
    assert_eq!(backend.hub().subscriber_count(), 2);
    assert!(client.status().iter().all(|s| !s.dead && s.tokens == 1));

    drop(session);
    assert!(client.status().is_empty());
    assert_eq!(backend.hub().subscriber_count(), 0);
}

#[tokio::test]
async fn lagging_session_reloads_annotations_from_the_store() {
    let (_dir, backend) = setup_backend();
    seed_session(&backend).await;
    let alice_client = client_for(
        &backend,
        "alice",
        SyncSettings {
            channel_capacity: 1,
            ..SyncSettings::default()
        },
    );
    let bob_client = client_for(&backend, "bob", SyncSettings::default());
    let mut alice = alice_client.open_collab_session("s1").await.expect("open failed");
    let mut bob = bob_client.open_collab_session("s1").await.expect("open failed");

    for n in 0..5 {
        bob.add_annotation(AnnotationKind::Comment, json!({"text": format!("note {n}")}))
            .await
            .expect("add failed");
    }
    bob.save_content("revised".to_string()).await.expect("save failed");

    let mut resynced = false;
    for _ in 0..10 {
        match within(alice.next()).await {
            Some(CollabUpdate::Resynced) => {
                resynced = true;
                break;
            }
            Some(CollabUpdate::Annotations)
            | Some(CollabUpdate::Content)
            | Some(CollabUpdate::Ignored(_)) => {}
            other => panic!("expected updates and a resync, got {:?}", other),
        }
    }
    assert!(resynced);

    let stored = backend
        .sqlite()
        .list_annotations("s1")
        .await
        .expect("list failed");
    assert_eq!(stored.len(), 5);
    assert_eq!(alice.document().map(|d| d.annotations()), Some(stored.as_slice()));
    assert_eq!(content(&alice), "revised");
}
