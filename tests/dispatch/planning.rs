use std::sync::Arc;

use fleetpost::channels::Channel;
use fleetpost::dispatch::{DispatchOutcome, Motion, SkipReason};
use fleetpost::lifecycle::LifecycleStatus;
use fleetpost::store::{ArtifactStatus, QueuedArtifact};

use super::dispatch_harness::{
    artifact_aged, default_options, dispatch_fixture, dispatch_log_lines, fixture_over,
    memory_store, payload, seed_approved, today, warmup_today, MappedLifecycle,
};

#[tokio::test]
async fn the_daily_ceiling_caps_each_channel() {
    let warmup = warmup_today(5, 25);
    let fixture = dispatch_fixture(&warmup, default_options());

    for n in 0..8 {
        let artifact = artifact_aged(
            Channel::Email,
            &format!("lead-{n}"),
            Motion::Primary,
            1,
            i64::from(n) * 60,
        );
        seed_approved(&fixture.store, &artifact).await;
    }

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");

    assert_eq!(result.sent, 5);
    assert_eq!(result.skipped.get(&SkipReason::SkippedCeiling), Some(&3));
    assert_eq!(result.per_channel.get(&Channel::Email), Some(&5));
    assert_eq!(fixture.email.added_addresses().len(), 5);

    // The overflow stays approved for the next cycle.
    let approved = fixture.store.list_approved(50).await.expect("list");
    assert_eq!(approved.artifacts.len(), 3);
}

#[tokio::test]
async fn lower_tiers_ride_first_and_recency_breaks_ties() {
    let warmup = warmup_today(2, 25);
    let fixture = dispatch_fixture(&warmup, default_options());

    let tier_two = artifact_aged(Channel::Email, "lead-t2", Motion::Primary, 2, 60);
    let tier_one_old = artifact_aged(Channel::Email, "lead-t1-old", Motion::Primary, 1, 7_200);
    let tier_one_new = artifact_aged(Channel::Email, "lead-t1-new", Motion::Primary, 1, 3_600);
    for artifact in [&tier_two, &tier_one_old, &tier_one_new] {
        seed_approved(&fixture.store, artifact).await;
    }

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");

    assert_eq!(result.sent, 2);
    assert_eq!(
        fixture.email.added_addresses(),
        vec![
            "lead-t1-new@acme.example".to_string(),
            "lead-t1-old@acme.example".to_string(),
        ]
    );
    let leftover = fixture.store.get(&tier_two.id).await.expect("get");
    assert_eq!(leftover.status, ArtifactStatus::Approved);
}

#[tokio::test]
async fn recipients_contacted_today_are_excluded_without_spending_budget() {
    let warmup = warmup_today(1, 25);
    let fixture = dispatch_fixture(&warmup, default_options());

    // The duplicate outranks the clean artifact, so a budget-consuming skip
    // would starve the clean one.
    let duplicate = artifact_aged(Channel::Email, "lead-dup", Motion::Primary, 1, 60);
    let clean = artifact_aged(Channel::Email, "lead-clean", Motion::Primary, 1, 3_600);
    seed_approved(&fixture.store, &duplicate).await;
    seed_approved(&fixture.store, &clean).await;
    fixture
        .store
        .record_sent("lead-dup", today(), chrono::Utc::now())
        .await
        .expect("record");

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");

    assert_eq!(result.sent, 1);
    assert_eq!(result.skipped.get(&SkipReason::AlreadySentToday), Some(&1));
    assert_eq!(
        fixture.email.added_addresses(),
        vec!["lead-clean@acme.example".to_string()]
    );
    assert_eq!(
        fixture.store.get(&duplicate.id).await.expect("get").status,
        ArtifactStatus::Approved
    );
}

#[tokio::test]
async fn terminal_and_unreachable_lifecycles_fail_closed() {
    let warmup = warmup_today(5, 25);
    let lifecycle = MappedLifecycle::default()
        .with_status("lead-bounced", LifecycleStatus::Bounced)
        .with_unavailable("lead-dark");
    let fixture = fixture_over(
        memory_store(),
        &warmup,
        default_options(),
        Arc::new(lifecycle),
    );

    for recipient in ["lead-bounced", "lead-dark", "lead-live"] {
        let artifact = QueuedArtifact::new(
            Channel::Email,
            payload(recipient, Motion::Primary, 1),
        );
        seed_approved(&fixture.store, &artifact).await;
    }

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");

    assert_eq!(result.sent, 1);
    assert_eq!(result.skipped.get(&SkipReason::LifecycleTerminal), Some(&1));
    assert_eq!(
        result.skipped.get(&SkipReason::LifecycleUnavailable),
        Some(&1)
    );
    assert_eq!(
        fixture.email.added_addresses(),
        vec!["lead-live@acme.example".to_string()]
    );
}

#[tokio::test]
async fn a_dispatch_mark_from_today_blocks_other_channels() {
    let warmup = warmup_today(5, 25);
    let fixture = dispatch_fixture(&warmup, default_options());

    let mut marked = QueuedArtifact::new(Channel::Email, payload("lead-m", Motion::Primary, 1));
    marked.dispatched_on.insert(Channel::Linkedin, today());
    seed_approved(&fixture.store, &marked).await;

    let mut stale = QueuedArtifact::new(Channel::Email, payload("lead-s", Motion::Primary, 1));
    stale
        .dispatched_on
        .insert(Channel::Linkedin, today().pred_opt().expect("date"));
    seed_approved(&fixture.store, &stale).await;

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");

    assert_eq!(result.sent, 1);
    assert_eq!(result.skipped.get(&SkipReason::CrossChannelToday), Some(&1));
    assert_eq!(
        fixture.email.added_addresses(),
        vec!["lead-s@acme.example".to_string()]
    );
}

#[tokio::test]
async fn the_domain_cap_holds_within_a_batch() {
    let warmup = warmup_today(10, 2);
    let fixture = dispatch_fixture(&warmup, default_options());

    for (n, domain) in [
        (1, "acme.example"),
        (2, "acme.example"),
        (3, "acme.example"),
        (4, "acme.example"),
        (5, "globex.example"),
    ] {
        let mut artifact = artifact_aged(
            Channel::Email,
            &format!("lead-{n}"),
            Motion::Primary,
            1,
            i64::from(n) * 60,
        );
        artifact.payload.sending_domain = Some(domain.to_string());
        seed_approved(&fixture.store, &artifact).await;
    }

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");

    assert_eq!(result.sent, 3);
    assert_eq!(result.skipped.get(&SkipReason::SkippedCeiling), Some(&2));

    // Two newest on the capped domain, plus the one on the other domain.
    assert_eq!(
        fixture.email.added_addresses(),
        vec![
            "lead-1@acme.example".to_string(),
            "lead-2@acme.example".to_string(),
            "lead-5@acme.example".to_string(),
        ]
    );
}

#[tokio::test]
async fn dry_runs_report_the_plan_without_side_effects() {
    let warmup = warmup_today(5, 25);
    let fixture = dispatch_fixture(&warmup, default_options());

    let first = QueuedArtifact::new(Channel::Email, payload("lead-1", Motion::Primary, 1));
    let second = QueuedArtifact::new(Channel::Linkedin, payload("lead-2", Motion::Primary, 1));
    seed_approved(&fixture.store, &first).await;
    seed_approved(&fixture.store, &second).await;

    let result = fixture
        .coordinator
        .run(Motion::Primary, true)
        .await
        .expect("dry run");

    assert!(result.dry_run);
    assert_eq!(result.sent, 2);
    assert_eq!(result.per_channel.get(&Channel::Email), Some(&1));
    assert_eq!(result.per_channel.get(&Channel::Linkedin), Some(&1));
    assert!(result.token.is_none());

    assert!(fixture.email.created.lock().unwrap().is_empty());
    assert!(fixture.linkedin.created.lock().unwrap().is_empty());
    assert!(dispatch_log_lines(&fixture).is_empty());
    assert_eq!(fixture.store.list_approved(10).await.expect("list").artifacts.len(), 2);
    assert!(!fixture
        .store
        .already_sent_today("lead-1", today())
        .await
        .expect("check"));
}

#[tokio::test]
async fn other_motions_and_disabled_channels_stay_queued_silently() {
    let warmup = warmup_today(5, 25);
    let mut options = default_options();
    options.enabled_channels = vec![Channel::Email];
    let fixture = dispatch_fixture(&warmup, options);

    let rides = QueuedArtifact::new(Channel::Email, payload("lead-1", Motion::Primary, 1));
    let wrong_motion = QueuedArtifact::new(Channel::Email, payload("lead-2", Motion::FollowUp, 1));
    let disabled = QueuedArtifact::new(Channel::Linkedin, payload("lead-3", Motion::Primary, 1));
    for artifact in [&rides, &wrong_motion, &disabled] {
        seed_approved(&fixture.store, artifact).await;
    }

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");

    assert_eq!(result.sent, 1);
    assert_eq!(result.total_skipped(), 0);
    assert_eq!(
        fixture.email.added_addresses(),
        vec!["lead-1@acme.example".to_string()]
    );
    for parked in [&wrong_motion, &disabled] {
        assert_eq!(
            fixture.store.get(&parked.id).await.expect("get").status,
            ArtifactStatus::Approved
        );
    }
}

#[tokio::test]
async fn successful_sends_settle_everywhere() {
    let warmup = warmup_today(5, 25);
    let fixture = dispatch_fixture(&warmup, default_options());
    let artifact = QueuedArtifact::new(Channel::Email, payload("lead-1", Motion::Primary, 1));
    seed_approved(&fixture.store, &artifact).await;

    let result = fixture
        .coordinator
        .run(Motion::Primary, false)
        .await
        .expect("run");
    assert_eq!(result.sent, 1);

    let settled = fixture.store.get(&artifact.id).await.expect("get");
    assert_eq!(settled.status, ArtifactStatus::Dispatched);
    assert_eq!(settled.dispatched_on.get(&Channel::Email), Some(&today()));
    assert!(fixture
        .store
        .already_sent_today("lead-1", today())
        .await
        .expect("check"));

    let lines = dispatch_log_lines(&fixture);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].recipient_id, "lead-1");
    assert_eq!(lines[0].artifact_id, artifact.id);
    assert!(lines[0].campaign_id.is_some());
    assert_eq!(lines[0].outcome, DispatchOutcome::Sent);
    assert!(
        lines[0]
            .dedup_keys
            .contains(&format!("daily:lead-1@{}", today()))
    );
}
