use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use fleetpost::error::ChannelCallError;
use fleetpost::guardrails::{
    ActionRequest, ActionType, Agent, AuditEntry, AuditLog, AuditResult, CallTarget,
    CircuitBreaker, CircuitState, GroundingEvidence, GroundingValidator, GuardrailsGateway,
    PermissionRegistry, RateLimiter, WarmupSchedule,
};

use super::dispatch_harness::{gateway_at, today, warmup_today};

fn target() -> CallTarget<'static> {
    CallTarget {
        integration: "email_api",
        channel: Some("email"),
        domain: None,
    }
}

fn send_request() -> ActionRequest {
    ActionRequest::new(Agent::Dispatcher, ActionType::AddRecipients)
        .with_grounding(GroundingEvidence::new("crm", "lead-1", Utc::now()))
}

fn failing_call() -> impl std::future::Future<Output = Result<(), ChannelCallError>> {
    async {
        Err(ChannelCallError::Failed {
            channel: "email".into(),
            operation: "add_recipients".into(),
            message: "upstream 500".into(),
        })
    }
}

fn audit_entries(dir: &Path) -> Vec<AuditEntry> {
    let mut entries = Vec::new();
    for file in std::fs::read_dir(dir.join("audit")).into_iter().flatten().flatten() {
        let contents = std::fs::read_to_string(file.path()).expect("audit readable");
        for line in contents.lines() {
            entries.push(serde_json::from_str(line).expect("audit line parses"));
        }
    }
    entries
}

#[tokio::test]
async fn a_tripped_circuit_rejects_without_touching_the_budget() {
    let tmp = TempDir::new().expect("temp dir");
    let warmup = warmup_today(25, 25);
    let gateway = gateway_at(tmp.path(), &warmup);
    let request = send_request();

    for _ in 0..3 {
        gateway
            .execute(&request, target(), failing_call)
            .await
            .expect_err("call fails");
    }
    assert_eq!(gateway.limiter().remaining("email", today()), 22);
    assert_eq!(
        gateway.circuits().state("email_api", Utc::now()),
        CircuitState::Open
    );

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let err = gateway
        .execute(&request, target(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ChannelCallError>(())
        })
        .await
        .expect_err("circuit rejects");
    assert_eq!(err.code(), "circuit_open");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The circuit check sits ahead of the rate limit, so the rejected
    // attempt consumed nothing.
    assert_eq!(gateway.limiter().remaining("email", today()), 22);
}

#[tokio::test]
async fn a_successful_probe_closes_an_open_circuit() {
    let tmp = TempDir::new().expect("temp dir");
    let warmup = warmup_today(25, 25);
    // Zero cool-down, so the probe is admitted on the very next call.
    let gateway = GuardrailsGateway::new(
        PermissionRegistry::builtin(),
        GroundingValidator::new(3_600),
        CircuitBreaker::new(3, 0),
        RateLimiter::new(WarmupSchedule::new(&warmup), warmup.domain_batch_cap),
        AuditLog::new(tmp.path().join("audit")),
        Duration::from_millis(500),
    );
    let request = send_request();

    for _ in 0..3 {
        gateway
            .execute(&request, target(), failing_call)
            .await
            .expect_err("call fails");
    }
    assert_eq!(
        gateway.circuits().state("email_api", Utc::now()),
        CircuitState::HalfOpen
    );

    gateway
        .execute(&request, target(), || async {
            Ok::<_, ChannelCallError>(())
        })
        .await
        .expect("probe succeeds");
    assert_eq!(
        gateway.circuits().state("email_api", Utc::now()),
        CircuitState::Closed
    );
    assert_eq!(gateway.circuits().snapshot()["email_api"].failure_count, 0);

    gateway
        .execute(&request, target(), || async {
            Ok::<_, ChannelCallError>(())
        })
        .await
        .expect("normal traffic resumes");
}

#[tokio::test]
async fn budget_exhaustion_leaves_the_circuit_closed() {
    let tmp = TempDir::new().expect("temp dir");
    let warmup = warmup_today(1, 25);
    let gateway = gateway_at(tmp.path(), &warmup);
    let request = send_request();

    gateway
        .execute(&request, target(), || async {
            Ok::<_, ChannelCallError>(())
        })
        .await
        .expect("first send fits");

    let err = gateway
        .execute(&request, target(), || async {
            Ok::<_, ChannelCallError>(())
        })
        .await
        .expect_err("ceiling reached");
    assert_eq!(err.code(), "rate_limited");

    let snapshot = gateway.circuits().snapshot();
    let circuit = snapshot.get("email_api").expect("tracked integration");
    assert_eq!(circuit.state, CircuitState::Closed);
    assert_eq!(circuit.failure_count, 0);
}

#[tokio::test]
async fn each_outcome_class_lands_in_the_audit_trail() {
    let tmp = TempDir::new().expect("temp dir");
    let warmup = warmup_today(25, 25);
    let gateway = gateway_at(tmp.path(), &warmup);

    gateway
        .execute(
            &ActionRequest::new(Agent::Prospector, ActionType::EnrichLead),
            target(),
            || async { Ok::<_, ChannelCallError>(()) },
        )
        .await
        .expect("allowed");

    gateway
        .execute(
            &ActionRequest::new(Agent::Copywriter, ActionType::CreateCampaign),
            target(),
            || async { Ok::<_, ChannelCallError>(()) },
        )
        .await
        .expect_err("denied");

    gateway
        .execute(&send_request(), target(), failing_call)
        .await
        .expect_err("failed");

    let entries = audit_entries(tmp.path());
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].result, AuditResult::Completed);
    assert!(entries[0].error_code.is_none());
    assert_eq!(entries[1].result, AuditResult::Rejected);
    assert_eq!(entries[1].error_code.as_deref(), Some("permission_denied"));
    assert_eq!(entries[2].result, AuditResult::Failed);
    assert_eq!(entries[2].error_code.as_deref(), Some("channel_call"));
}
