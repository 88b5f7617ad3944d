use std::sync::Arc;

use fleetpost::channels::Channel;
use fleetpost::dispatch::Motion;
use fleetpost::error::StoreError;
use fleetpost::store::{
    ArtifactStatus, MemoryBackend, QueuedArtifact, ReadSource, SharedStateStore,
};

use super::dispatch_harness::{artifact_aged, payload, seed_approved, today, PREFIX};

fn two_clients() -> (SharedStateStore, SharedStateStore) {
    let backend = MemoryBackend::new();
    let writer = SharedStateStore::new(Arc::new(backend.clone()), PREFIX, None).expect("store");
    let reader = SharedStateStore::new(Arc::new(backend), PREFIX, None).expect("store");
    (writer, reader)
}

#[tokio::test]
async fn pushes_are_visible_to_other_clients_immediately() {
    let (writer, reader) = two_clients();
    let artifact = QueuedArtifact::new(
        Channel::Email,
        payload("lead-1", Motion::Primary, 1),
    );
    writer.push(&artifact).await.expect("push");

    let fetched = reader.get(&artifact.id).await.expect("get");
    assert_eq!(fetched, artifact);

    let pending = reader.list_pending(10).await.expect("list");
    assert_eq!(pending.source, ReadSource::Index);
    assert_eq!(pending.artifacts.len(), 1);
    assert_eq!(pending.key_prefix, PREFIX);
}

#[tokio::test]
async fn approval_by_one_client_moves_the_artifact_for_all() {
    let (writer, reader) = two_clients();
    let artifact = QueuedArtifact::new(
        Channel::Linkedin,
        payload("lead-2", Motion::FollowUp, 2),
    );
    writer.push(&artifact).await.expect("push");

    let approved = reader
        .update_status(&artifact.id, ArtifactStatus::Approved)
        .await
        .expect("approve");
    assert_eq!(approved.status, ArtifactStatus::Approved);

    assert!(writer.list_pending(10).await.expect("pending").artifacts.is_empty());
    let approved_batch = writer.list_approved(10).await.expect("approved");
    assert_eq!(approved_batch.artifacts.len(), 1);
    assert_eq!(approved_batch.artifacts[0].id, artifact.id);
}

#[tokio::test]
async fn listings_come_back_newest_first() {
    let (store, _) = two_clients();
    let older = artifact_aged(
        Channel::Email,
        "lead-old",
        Motion::Primary,
        1,
        3_600,
    );
    let newer = artifact_aged(
        Channel::Email,
        "lead-new",
        Motion::Primary,
        1,
        60,
    );
    store.push(&older).await.expect("push older");
    store.push(&newer).await.expect("push newer");

    let pending = store.list_pending(10).await.expect("list");
    let recipients: Vec<&str> = pending
        .artifacts
        .iter()
        .map(|artifact| artifact.payload.recipient_id.as_str())
        .collect();
    assert_eq!(recipients, vec!["lead-new", "lead-old"]);

    let limited = store.list_pending(1).await.expect("list limited");
    assert_eq!(limited.artifacts.len(), 1);
    assert_eq!(limited.artifacts[0].payload.recipient_id, "lead-new");
}

#[tokio::test]
async fn a_rejection_drops_out_of_the_ordered_listing() {
    let (store, reader) = two_clients();
    let first = artifact_aged(Channel::Email, "lead-a", Motion::Primary, 1, 300);
    let second = artifact_aged(Channel::Email, "lead-b", Motion::Primary, 1, 200);
    let third = artifact_aged(Channel::Email, "lead-c", Motion::Primary, 1, 100);
    store.push(&first).await.expect("push");
    store.push(&second).await.expect("push");
    store.push(&third).await.expect("push");

    store
        .update_status(&second.id, ArtifactStatus::Rejected)
        .await
        .expect("reject");

    let pending = reader.list_pending(10).await.expect("list");
    let recipients: Vec<&str> = pending
        .artifacts
        .iter()
        .map(|artifact| artifact.payload.recipient_id.as_str())
        .collect();
    assert_eq!(recipients, vec!["lead-c", "lead-a"]);
}

#[tokio::test]
async fn reapplying_the_current_status_changes_nothing() {
    let (store, _) = two_clients();
    let artifact = QueuedArtifact::new(
        Channel::Email,
        payload("lead-3", Motion::Primary, 1),
    );
    let approved = seed_approved(&store, &artifact).await;

    let again = store
        .update_status(&artifact.id, ArtifactStatus::Approved)
        .await
        .expect("second approve");
    assert_eq!(again.updated_at, approved.updated_at);
    assert_eq!(store.list_approved(10).await.expect("list").artifacts.len(), 1);
}

#[tokio::test]
async fn rejected_artifacts_refuse_further_transitions() {
    let (store, _) = two_clients();
    let artifact = QueuedArtifact::new(
        Channel::Email,
        payload("lead-4", Motion::Revival, 3),
    );
    store.push(&artifact).await.expect("push");
    store
        .update_status(&artifact.id, ArtifactStatus::Rejected)
        .await
        .expect("reject");

    let err = store
        .update_status(&artifact.id, ArtifactStatus::Approved)
        .await
        .expect_err("terminal");
    match err {
        StoreError::InvalidTransition { from, to, .. } => {
            assert_eq!(from, "rejected");
            assert_eq!(to, "approved");
        }
        other => panic!("unexpected error {other}"),
    }

    let err = store
        .mark_dispatched(
            &artifact.id,
            Channel::Email,
            today(),
        )
        .await
        .expect_err("terminal");
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn mark_dispatched_stamps_the_channel_and_clears_the_queue() {
    let (store, reader) = two_clients();
    let artifact = QueuedArtifact::new(
        Channel::Linkedin,
        payload("lead-5", Motion::Primary, 1),
    );
    seed_approved(&store, &artifact).await;

    let date = today();
    let dispatched = store
        .mark_dispatched(&artifact.id, Channel::Linkedin, date)
        .await
        .expect("dispatch");
    assert_eq!(dispatched.status, ArtifactStatus::Dispatched);
    assert_eq!(
        dispatched.dispatched_on.get(&Channel::Linkedin),
        Some(&date)
    );

    assert!(reader.list_approved(10).await.expect("list").artifacts.is_empty());
    assert!(reader.list_pending(10).await.expect("list").artifacts.is_empty());

    // Marks survive the round trip through the other client.
    let fetched = reader.get(&artifact.id).await.expect("get");
    assert_eq!(fetched.dispatched_on.len(), 1);
}

#[tokio::test]
async fn sent_records_are_scoped_to_their_date() {
    let (store, reader) = two_clients();
    let date = today();
    let yesterday = date.pred_opt().expect("date");

    store
        .record_sent("lead-6", date, chrono::Utc::now())
        .await
        .expect("record");

    assert!(reader.already_sent_today("lead-6", date).await.expect("check"));
    assert!(!reader
        .already_sent_today("lead-6", yesterday)
        .await
        .expect("check"));
    assert!(!reader.already_sent_today("lead-7", date).await.expect("check"));
}

#[tokio::test]
async fn unknown_ids_surface_not_found() {
    let (store, _) = two_clients();
    let err = store.get("no-such-id").await.expect_err("missing");
    assert!(matches!(err, StoreError::NotFound(id) if id == "no-such-id"));

    let err = store
        .update_status("no-such-id", ArtifactStatus::Approved)
        .await
        .expect_err("missing");
    assert!(matches!(err, StoreError::NotFound(_)));
}
