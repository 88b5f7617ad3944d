use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use fleetpost::channels::Channel;
use fleetpost::dispatch::{DispatchOutcome, Motion, SkipReason};
use fleetpost::error::{FleetpostError, StoreError};
use fleetpost::lifecycle::StaticLifecycle;
use fleetpost::store::{
    ArtifactStatus, DiskMirror, MemoryBackend, QueuedArtifact, SharedStateStore,
};

use super::dispatch_harness::{
    artifact_aged, default_options, dispatch_fixture, dispatch_log_lines, fixture_over,
    payload, seed_approved, store_over, warmup_today, UnreachableBackend, PREFIX,
};

#[tokio::test]
async fn one_failing_recipient_does_not_stop_the_batch() {
    let warmup = warmup_today(5, 25);
    let fixture = dispatch_fixture(&warmup, default_options());

    let steady = artifact_aged(Channel::Email, "lead-1", Motion::Primary, 1, 180);
    let flaky = artifact_aged(Channel::Email, "lead-2", Motion::Primary, 1, 120);
    let newest = artifact_aged(Channel::Email, "lead-3", Motion::Primary, 1, 60);
    for artifact in [&steady, &flaky, &newest] {
        seed_approved(&fixture.store, artifact).await;
    }
    fixture.email.fail_address("lead-2@acme.example");

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");

    assert_eq!(result.sent, 2);
    assert_eq!(result.failed, 1);
    assert!(result.halted.is_none());
    assert_eq!(
        fixture.email.added_addresses(),
        vec![
            "lead-3@acme.example".to_string(),
            "lead-1@acme.example".to_string(),
        ]
    );

    // The failure stays approved for a retry; the sends settle terminal.
    assert_eq!(
        fixture.store.get(&flaky.id).await.expect("get").status,
        ArtifactStatus::Approved
    );
    for sent in [&steady, &newest] {
        assert_eq!(
            fixture.store.get(&sent.id).await.expect("get").status,
            ArtifactStatus::Dispatched
        );
    }

    let lines = dispatch_log_lines(&fixture);
    assert_eq!(lines.len(), 3);
    let failed: Vec<_> = lines
        .iter()
        .filter(|line| {
            matches!(&line.outcome, DispatchOutcome::Failed { error_code } if error_code == "channel_call")
        })
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].recipient_id, "lead-2");
}

#[tokio::test]
async fn a_container_failure_takes_down_one_channel_only() {
    let warmup = warmup_today(5, 25);
    let fixture = dispatch_fixture(&warmup, default_options());

    let email = QueuedArtifact::new(Channel::Email, payload("lead-1", Motion::Primary, 1));
    let linkedin = QueuedArtifact::new(Channel::Linkedin, payload("lead-2", Motion::Primary, 1));
    seed_approved(&fixture.store, &email).await;
    seed_approved(&fixture.store, &linkedin).await;
    fixture.email.fail_next_creates(1);

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");

    assert_eq!(result.sent, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.per_channel.get(&Channel::Linkedin), Some(&1));

    assert_eq!(
        fixture.store.get(&email.id).await.expect("get").status,
        ArtifactStatus::Approved
    );
    assert_eq!(
        fixture.store.get(&linkedin.id).await.expect("get").status,
        ArtifactStatus::Dispatched
    );
}

#[tokio::test]
async fn an_open_circuit_defers_the_channel_without_platform_calls() {
    let warmup = warmup_today(5, 25);
    let fixture = dispatch_fixture(&warmup, default_options());

    let first = QueuedArtifact::new(Channel::Email, payload("lead-1", Motion::Primary, 1));
    let second = QueuedArtifact::new(Channel::Email, payload("lead-2", Motion::Primary, 1));
    let other = QueuedArtifact::new(Channel::Linkedin, payload("lead-3", Motion::Primary, 1));
    for artifact in [&first, &second, &other] {
        seed_approved(&fixture.store, artifact).await;
    }
    for _ in 0..3 {
        fixture.gateway.circuits().record_failure("email_api", Utc::now());
    }

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");

    assert_eq!(result.sent, 1);
    assert_eq!(result.failed, 0);
    assert_eq!(result.skipped.get(&SkipReason::CircuitOpen), Some(&2));

    assert!(fixture.email.created.lock().unwrap().is_empty());
    assert_eq!(fixture.linkedin.created.lock().unwrap().len(), 1);
    for parked in [&first, &second] {
        assert_eq!(
            fixture.store.get(&parked.id).await.expect("get").status,
            ArtifactStatus::Approved
        );
    }
}

#[tokio::test]
async fn a_container_with_no_sends_is_rolled_back() {
    let warmup = warmup_today(5, 25);
    let fixture = dispatch_fixture(&warmup, default_options());
    let artifact = QueuedArtifact::new(Channel::Email, payload("lead-1", Motion::Primary, 1));
    seed_approved(&fixture.store, &artifact).await;
    fixture.email.fail_address("lead-1@acme.example");

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");

    assert_eq!(result.sent, 0);
    assert_eq!(result.failed, 1);

    let created = fixture.email.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(
        *fixture.email.deleted.lock().unwrap(),
        vec![created[0].id.clone()]
    );
    assert_eq!(
        fixture.store.get(&artifact.id).await.expect("get").status,
        ArtifactStatus::Approved
    );
}

#[tokio::test]
async fn dispatch_refuses_to_run_on_mirror_data() {
    let mirror_dir = TempDir::new().expect("temp dir");

    // A healthy client mirrored an approved artifact before the store went
    // down.
    let healthy = SharedStateStore::new(
        Arc::new(MemoryBackend::new()),
        PREFIX,
        Some(DiskMirror::new(mirror_dir.path())),
    )
    .expect("store");
    let mut artifact = QueuedArtifact::new(Channel::Email, payload("lead-1", Motion::Primary, 1));
    artifact.status = ArtifactStatus::Approved;
    healthy.push(&artifact).await.expect("push");

    let warmup = warmup_today(5, 25);
    let store = store_over(
        Arc::new(UnreachableBackend),
        Some(DiskMirror::new(mirror_dir.path())),
    );
    let fixture = fixture_over(store, &warmup, default_options(), Arc::new(StaticLifecycle));

    // The mirror can list the batch, but dispatch must not act on it.
    assert_eq!(
        fixture.store.list_approved(10).await.expect("mirror").artifacts.len(),
        1
    );
    let err = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect_err("mirror refused");
    match err {
        FleetpostError::Store(StoreError::Unavailable(reason)) => {
            assert!(reason.contains("refusing to dispatch from mirror"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(fixture.email.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn spent_budget_carries_over_to_the_next_process() {
    let warmup = warmup_today(5, 25);
    let backend = MemoryBackend::new();
    let first_process = fixture_over(
        store_over(Arc::new(backend.clone()), None),
        &warmup,
        default_options(),
        Arc::new(StaticLifecycle),
    );
    let second_process = fixture_over(
        store_over(Arc::new(backend), None),
        &warmup,
        default_options(),
        Arc::new(StaticLifecycle),
    );

    for n in 0..2 {
        let artifact = QueuedArtifact::new(
            Channel::Email,
            payload(&format!("lead-a{n}"), Motion::Primary, 1),
        );
        seed_approved(&first_process.store, &artifact).await;
    }
    let first_run = first_process
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("first run");
    assert_eq!(first_run.sent, 2);

    for n in 0..5 {
        let artifact = QueuedArtifact::new(
            Channel::Email,
            payload(&format!("lead-b{n}"), Motion::Primary, 1),
        );
        seed_approved(&second_process.store, &artifact).await;
    }
    let second_run = second_process
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("second run");

    // Day one ceiling is 5 and the first process already spent 2 of it.
    assert_eq!(second_run.sent, 3);
    assert_eq!(second_run.skipped.get(&SkipReason::SkippedCeiling), Some(&2));
}
