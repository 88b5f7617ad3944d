pub mod audit;
pub mod circuit;
pub mod consensus;
pub mod grounding;
pub mod permissions;
pub mod rate_limit;

pub use audit::{AuditEntry, AuditLog, AuditResult};
pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use consensus::{ConsensusTally, Vote, tally, voting_weight};
pub use grounding::{GroundingEvidence, GroundingValidator};
pub use permissions::{
    ActionType, Agent, BLOCKED_OPERATIONS, Permission, PermissionRegistry, RiskLevel,
};
pub use rate_limit::{DayWindow, RateLimiter, WarmupSchedule};

use chrono::Utc;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::{ChannelCallError, GuardrailError};

/// One action an agent wants performed, with whatever supporting material
/// the caller has: grounding evidence for high-risk actions, consensus votes
/// for critical ones.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub agent: Agent,
    pub action: ActionType,
    pub grounding: Option<GroundingEvidence>,
    pub votes: Vec<Vote>,
}

impl ActionRequest {
    #[must_use]
    pub fn new(agent: Agent, action: ActionType) -> Self {
        Self {
            agent,
            action,
            grounding: None,
            votes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_grounding(mut self, evidence: GroundingEvidence) -> Self {
        self.grounding = Some(evidence);
        self
    }

    #[must_use]
    pub fn with_votes(mut self, votes: Vec<Vote>) -> Self {
        self.votes = votes;
        self
    }
}

/// Where the underlying call lands. `integration` keys the circuit breaker;
/// `channel` (when the call consumes send budget) keys the rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct CallTarget<'a> {
    pub integration: &'a str,
    pub channel: Option<&'a str>,
    pub domain: Option<&'a str>,
}

/// The single choke point for externally visible side effects.
///
/// `execute` runs the full check sequence in a fixed order — blocked
/// operation class, permission, grounding, consensus, circuit, rate limit —
/// and only then invokes the supplied call under a timeout. Checks are
/// synchronous against in-process state; the decision itself never waits on
/// the network. Every request leaves an audit entry, rejected or not.
pub struct GuardrailsGateway {
    registry: PermissionRegistry,
    grounding: GroundingValidator,
    circuits: CircuitBreaker,
    limiter: RateLimiter,
    audit: AuditLog,
    call_timeout: std::time::Duration,
}

impl GuardrailsGateway {
    #[must_use]
    pub fn new(
        registry: PermissionRegistry,
        grounding: GroundingValidator,
        circuits: CircuitBreaker,
        limiter: RateLimiter,
        audit: AuditLog,
        call_timeout: std::time::Duration,
    ) -> Self {
        Self {
            registry,
            grounding,
            circuits,
            limiter,
            audit,
            call_timeout,
        }
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn circuits(&self) -> &CircuitBreaker {
        &self.circuits
    }

    /// Run `call` if and only if every guardrail admits it.
    ///
    /// On rejection the call is never invoked and the returned error names
    /// the check that refused. On invocation, success and failure both feed
    /// the circuit breaker for `target.integration`.
    pub async fn execute<T, F, Fut>(
        &self,
        request: &ActionRequest,
        target: CallTarget<'_>,
        call: F,
    ) -> Result<T, GuardrailError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ChannelCallError>>,
    {
        let started = Instant::now();
        let risk = self
            .registry
            .lookup(request.agent, request.action)
            .map_or_else(|| request.action.base_risk(), |p| p.risk);

        let grounding_refs = match self.preflight(request, target) {
            Ok(reference) => reference.into_iter().collect::<Vec<_>>(),
            Err(err) => {
                debug!(
                    "guardrail rejected {}/{}: {err}",
                    request.agent, request.action
                );
                self.record(request, risk, AuditResult::Rejected, &[], started, Some(err.code()))
                    .await;
                return Err(err);
            }
        };

        let call_result = match tokio::time::timeout(self.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ChannelCallError::Timeout {
                channel: target.channel.unwrap_or(target.integration).to_string(),
                operation: request.action.to_string(),
                timeout_ms: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match call_result {
            Ok(value) => {
                self.circuits.record_success(target.integration);
                self.record(
                    request,
                    risk,
                    AuditResult::Completed,
                    &grounding_refs,
                    started,
                    None,
                )
                .await;
                Ok(value)
            }
            Err(call_err) => {
                self.circuits.record_failure(target.integration, Utc::now());
                warn!("outbound call failed: {call_err}");
                let err = GuardrailError::Channel(call_err);
                self.record(
                    request,
                    risk,
                    AuditResult::Failed,
                    &grounding_refs,
                    started,
                    Some(err.code()),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Checks 1 through 6, in order, without invoking anything.
    fn preflight(
        &self,
        request: &ActionRequest,
        target: CallTarget<'_>,
    ) -> Result<Option<String>, GuardrailError> {
        let now = Utc::now();
        let today = now.date_naive();

        if request.action.is_blocked() {
            return Err(GuardrailError::BlockedOperation {
                operation: request.action.to_string(),
            });
        }

        let Some(permission) = self.registry.lookup(request.agent, request.action) else {
            return Err(GuardrailError::ContractViolation {
                agent: request.agent.to_string(),
                action: request.action.to_string(),
            });
        };
        if !permission.allowed {
            return Err(GuardrailError::PermissionDenied {
                agent: request.agent.to_string(),
                action: request.action.to_string(),
            });
        }

        let reference = self.grounding.check(
            request.action,
            permission.risk,
            request.grounding.as_ref(),
            now,
        )?;

        if permission.risk.requires_consensus() {
            let result = consensus::tally(&request.votes);
            if !result.accepted() {
                return Err(GuardrailError::PendingApproval {
                    action: request.action.to_string(),
                    approved_weight: result.approved_weight,
                    total_weight: result.total_weight,
                });
            }
        }

        self.circuits.admit(target.integration, now)?;

        if let Some(channel) = target.channel {
            if let Err(err) = self.limiter.try_consume(channel, target.domain, today) {
                // The circuit admitted us; give any claimed probe slot back.
                self.circuits.release_probe(target.integration);
                return Err(err);
            }
        }

        Ok(reference)
    }

    async fn record(
        &self,
        request: &ActionRequest,
        risk: RiskLevel,
        result: AuditResult,
        grounding_refs: &[String],
        started: Instant,
        error_code: Option<&'static str>,
    ) {
        let mut entry = AuditEntry::new(request.agent, request.action, risk, result);
        entry.grounding_refs = grounding_refs.to_vec();
        entry.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        entry.error_code = error_code.map(str::to_string);
        if let Err(err) = self.audit.append(&entry).await {
            tracing::error!(
                "audit append failed for {}/{}: {err}",
                request.agent,
                request.action
            );
        }
    }
}
