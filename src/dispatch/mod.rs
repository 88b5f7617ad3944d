pub mod approval;
pub mod dedup;
pub mod log;

pub use approval::{ApprovalGate, ApprovalTokenRecord, batch_hash};
pub use dedup::{DedupChecker, SkipReason};
pub use log::{DispatchLog, DispatchOutcome, DispatchRecord};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{AdapterRegistry, CampaignRef, Channel, ChannelAdapter, RecipientRef};
use crate::config::Config;
use crate::error::{ChannelCallError, GuardrailError, Result, StoreError};
use crate::guardrails::{
    ActionRequest, ActionType, Agent, CallTarget, CircuitSnapshot, DayWindow, GroundingEvidence,
    GuardrailsGateway,
};
use crate::lifecycle::RecipientLifecycle;
use crate::store::{QueuedArtifact, SharedStateStore};

const RATE_WINDOWS_SUFFIX: &str = "guard:rate_windows";
const CIRCUITS_SUFFIX: &str = "guard:circuits";

/// The cadence a run serves. An artifact only rides its own motion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Motion {
    Primary,
    FollowUp,
    Revival,
}

/// What one run did (or, for a dry run, would have done). Partial success is
/// the normal shape: sent, failed, and skipped all coexist.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub motion: Motion,
    pub date: NaiveDate,
    pub dry_run: bool,
    pub sent: u32,
    pub failed: u32,
    pub skipped: BTreeMap<SkipReason, u32>,
    pub per_channel: BTreeMap<Channel, u32>,
    /// Set when an approval recheck failed mid-batch and the remainder was
    /// abandoned.
    pub halted: Option<String>,
    /// Token minted by a dry run when this deployment requires approval.
    pub token: Option<String>,
}

impl DispatchResult {
    fn new(motion: Motion, date: NaiveDate, dry_run: bool) -> Self {
        Self {
            motion,
            date,
            dry_run,
            sent: 0,
            failed: 0,
            skipped: BTreeMap::new(),
            per_channel: BTreeMap::new(),
            halted: None,
            token: None,
        }
    }

    fn note_skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason).or_insert(0) += 1;
    }

    fn note_sent(&mut self, channel: Channel) {
        self.sent += 1;
        *self.per_channel.entry(channel).or_insert(0) += 1;
    }

    #[must_use]
    pub fn total_skipped(&self) -> u32 {
        self.skipped.values().sum()
    }
}

/// Knobs the coordinator reads from config at wiring time.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub batch_limit: usize,
    pub require_token: bool,
    pub token_ttl_secs: u64,
    pub enabled_channels: Vec<Channel>,
}

impl CoordinatorOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut enabled_channels = Vec::new();
        if config.channels.email {
            enabled_channels.push(Channel::Email);
        }
        if config.channels.linkedin {
            enabled_channels.push(Channel::Linkedin);
        }
        Self {
            batch_limit: config.dispatch.batch_limit,
            require_token: config.approval.require_token,
            token_ttl_secs: config.approval.token_ttl_secs,
            enabled_channels,
        }
    }
}

struct BatchPlan {
    send: Vec<QueuedArtifact>,
    excluded: Vec<(QueuedArtifact, SkipReason)>,
}

impl BatchPlan {
    fn ids(&self) -> Vec<String> {
        self.send.iter().map(|artifact| artifact.id.clone()).collect()
    }
}

struct RunContext<'a> {
    motion: Motion,
    today: NaiveDate,
    read_at: DateTime<Utc>,
    run_id: &'a str,
    token: Option<&'a str>,
}

enum ChannelVerdict {
    Completed,
    HaltBatch(String),
}

/// Drives one dispatch run end to end: read approved artifacts, plan under
/// today's ceilings, then push each recipient through the guardrails
/// gateway.
///
/// The plan is deterministic for a given store state and date, so the ids a
/// dry run reports are exactly the ids a real run will bind its approval
/// token to.
pub struct DispatchCoordinator {
    store: Arc<SharedStateStore>,
    gateway: Arc<GuardrailsGateway>,
    adapters: Arc<AdapterRegistry>,
    lifecycle: Arc<dyn RecipientLifecycle>,
    log: DispatchLog,
    options: CoordinatorOptions,
}

impl DispatchCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<SharedStateStore>,
        gateway: Arc<GuardrailsGateway>,
        adapters: Arc<AdapterRegistry>,
        lifecycle: Arc<dyn RecipientLifecycle>,
        log: DispatchLog,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            store,
            gateway,
            adapters,
            lifecycle,
            log,
            options,
        }
    }

    pub async fn run(&self, motion: Motion, dry_run: bool) -> Result<DispatchResult> {
        self.run_with_token(motion, dry_run, None).await
    }

    /// Full run entry point. `token` redeems a previously issued batch
    /// approval; it is mandatory when the deployment requires one.
    pub async fn run_with_token(
        &self,
        motion: Motion,
        dry_run: bool,
        token: Option<&str>,
    ) -> Result<DispatchResult> {
        let read_at = Utc::now();
        let today = read_at.date_naive();
        let run_id = Uuid::new_v4().to_string();

        if !dry_run && self.options.require_token && token.is_none() {
            return Err(GuardrailError::ExpiredApproval {
                reason: "this deployment requires a batch approval token".into(),
            }
            .into());
        }

        hydrate_guard_state(&self.store, &self.gateway).await;

        let batch = self.store.list_approved(self.options.batch_limit).await?;
        if !batch.store_reachable {
            return Err(StoreError::Unavailable(
                "refusing to dispatch from mirror data; the authoritative store is required"
                    .into(),
            )
            .into());
        }

        let candidates = self.select_candidates(batch.artifacts, motion);
        let run = RunContext {
            motion,
            today,
            read_at,
            run_id: &run_id,
            token,
        };
        let plan = self.plan_batch(candidates, today).await?;
        let mut result = DispatchResult::new(motion, today, dry_run);

        if dry_run {
            for (_, reason) in &plan.excluded {
                result.note_skip(*reason);
            }
            for artifact in &plan.send {
                result.note_sent(artifact.channel);
            }
            if self.options.require_token && !plan.send.is_empty() {
                let gate = ApprovalGate::new(&self.store, self.token_ttl());
                let record = gate.issue(&plan.ids(), read_at).await?;
                info!(
                    "approval token issued for {} artifacts, expires {}",
                    plan.send.len(),
                    record.expires_at.to_rfc3339()
                );
                result.token = Some(record.token);
            }
            return Ok(result);
        }

        if let Some(token) = token {
            let gate = ApprovalGate::new(&self.store, self.token_ttl());
            gate.consume(token, &plan.ids(), &run_id, read_at).await?;
        }

        for (artifact, reason) in &plan.excluded {
            result.note_skip(*reason);
            self.log_outcome(
                &run,
                artifact,
                None,
                DispatchOutcome::Skipped { reason: *reason },
            )
            .await;
        }

        self.gateway.limiter().begin_batch();

        let mut by_channel: BTreeMap<Channel, Vec<QueuedArtifact>> = BTreeMap::new();
        for artifact in plan.send {
            by_channel.entry(artifact.channel).or_default().push(artifact);
        }

        for (channel, artifacts) in by_channel {
            match self.run_channel(&run, channel, artifacts, &mut result).await? {
                ChannelVerdict::Completed => {}
                ChannelVerdict::HaltBatch(reason) => {
                    warn!("dispatch halted: {reason}");
                    result.halted = Some(reason);
                    break;
                }
            }
        }

        flush_guard_state(&self.store, &self.gateway).await;
        Ok(result)
    }

    fn token_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.options.token_ttl_secs).unwrap_or(i64::MAX))
    }

    /// Motion and channel filter plus priority order: tier ascending, then
    /// newest first within a tier.
    fn select_candidates(
        &self,
        artifacts: Vec<QueuedArtifact>,
        motion: Motion,
    ) -> Vec<QueuedArtifact> {
        let mut candidates: Vec<QueuedArtifact> = artifacts
            .into_iter()
            .filter(|artifact| artifact.payload.motion == motion)
            .filter(|artifact| {
                if !self.options.enabled_channels.contains(&artifact.channel) {
                    debug!(
                        "artifact {} skipped: channel {} disabled",
                        artifact.id, artifact.channel
                    );
                    return false;
                }
                if self.adapters.get(artifact.channel).is_none() {
                    debug!(
                        "artifact {} skipped: no adapter for {}",
                        artifact.id, artifact.channel
                    );
                    return false;
                }
                true
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.payload
                .tier
                .cmp(&b.payload.tier)
                .then(b.created_at.cmp(&a.created_at))
        });
        candidates
    }

    /// Walk candidates in priority order, excluding via the three dedup
    /// layers and deferring whatever exceeds today's remaining budget.
    /// Exclusions consume no budget: the next eligible candidate backfills
    /// the slot.
    async fn plan_batch(
        &self,
        candidates: Vec<QueuedArtifact>,
        today: NaiveDate,
    ) -> Result<BatchPlan> {
        let dedup = DedupChecker::new(&self.store, self.lifecycle.as_ref());
        let limiter = self.gateway.limiter();
        let domain_cap = limiter.domain_batch_cap();

        let mut budget: HashMap<Channel, u32> = HashMap::new();
        let mut domain_used: HashMap<String, u32> = HashMap::new();
        let mut plan = BatchPlan {
            send: Vec::new(),
            excluded: Vec::new(),
        };

        for artifact in candidates {
            if let Some(reason) = dedup.check(&artifact, today).await? {
                plan.excluded.push((artifact, reason));
                continue;
            }

            let remaining = budget
                .entry(artifact.channel)
                .or_insert_with(|| limiter.remaining(&artifact.channel.to_string(), today));
            if *remaining == 0 {
                plan.excluded.push((artifact, SkipReason::SkippedCeiling));
                continue;
            }

            if let Some(domain) = &artifact.payload.sending_domain {
                let used = domain_used
                    .entry(format!("{}/{domain}", artifact.channel))
                    .or_insert(0);
                if *used >= domain_cap {
                    plan.excluded.push((artifact, SkipReason::SkippedCeiling));
                    continue;
                }
                *used += 1;
            }

            *remaining -= 1;
            plan.send.push(artifact);
        }

        Ok(plan)
    }

    async fn run_channel(
        &self,
        run: &RunContext<'_>,
        channel: Channel,
        artifacts: Vec<QueuedArtifact>,
        result: &mut DispatchResult,
    ) -> Result<ChannelVerdict> {
        let Some(adapter) = self.adapters.get(channel) else {
            // Filtered during selection; an empty registry entry here means
            // wiring changed mid-run.
            warn!("no adapter for {channel}, leaving its artifacts approved");
            return Ok(ChannelVerdict::Completed);
        };
        let integration = adapter.integration().to_string();
        let channel_name = channel.to_string();

        let campaign = match self
            .create_container(run, &adapter, &integration, channel, &artifacts)
            .await
        {
            Ok(campaign) => campaign,
            Err(gate_err) => {
                self.settle_container_failure(run, channel, &artifacts, &gate_err, result)
                    .await;
                return Ok(ChannelVerdict::Completed);
            }
        };

        let mut added: u32 = 0;
        let mut pending = artifacts.into_iter();
        while let Some(artifact) = pending.next() {
            if let Some(token) = run.token {
                let gate = ApprovalGate::new(&self.store, self.token_ttl());
                if let Err(err) = gate.recheck(token, run.run_id, Utc::now()).await {
                    self.rollback_if_empty(run, &adapter, &integration, &campaign, added)
                        .await;
                    return Ok(ChannelVerdict::HaltBatch(format!(
                        "approval no longer valid: {err}"
                    )));
                }
            }

            let request = ActionRequest::new(Agent::Dispatcher, ActionType::AddRecipients)
                .with_grounding(GroundingEvidence::new(
                    "shared_store",
                    &artifact.id,
                    run.read_at,
                ));
            let target = CallTarget {
                integration: &integration,
                channel: Some(&channel_name),
                domain: artifact.payload.sending_domain.as_deref(),
            };
            let recipient = RecipientRef {
                recipient_id: artifact.payload.recipient_id.clone(),
                address: artifact.payload.address.clone(),
            };

            let call_outcome = self
                .gateway
                .execute(&request, target, || {
                    let adapter = Arc::clone(&adapter);
                    let campaign = campaign.clone();
                    let channel_name = channel_name.clone();
                    async move {
                        adapter
                            .add_recipients(&campaign, &[recipient])
                            .await
                            .map_err(|err| ChannelCallError::Failed {
                                channel: channel_name,
                                operation: "add_recipients".into(),
                                message: format!("{err:#}"),
                            })
                    }
                })
                .await;

            match call_outcome {
                Ok(()) => {
                    added += 1;
                    result.note_sent(channel);
                    self.settle_sent(run, &artifact, channel, &campaign).await;
                }
                Err(GuardrailError::RateLimited { scope, .. }) if scope.starts_with("domain:") => {
                    // Domain cap inside the batch: this recipient waits, the
                    // channel keeps going.
                    result.note_skip(SkipReason::SkippedCeiling);
                    self.log_outcome(
                        run,
                        &artifact,
                        Some(&campaign.id),
                        DispatchOutcome::Skipped {
                            reason: SkipReason::SkippedCeiling,
                        },
                    )
                    .await;
                }
                Err(err @ GuardrailError::RateLimited { .. }) => {
                    info!("channel {channel} budget exhausted: {err}");
                    self.defer_rest(run, artifact, pending, SkipReason::SkippedCeiling, result)
                        .await;
                    break;
                }
                Err(err @ GuardrailError::CircuitOpen { .. }) => {
                    warn!("circuit open for {integration}: {err}");
                    self.defer_rest(run, artifact, pending, SkipReason::CircuitOpen, result)
                        .await;
                    break;
                }
                Err(err) => {
                    result.failed += 1;
                    self.log_outcome(
                        run,
                        &artifact,
                        Some(&campaign.id),
                        DispatchOutcome::Failed {
                            error_code: err.code().to_string(),
                        },
                    )
                    .await;
                }
            }
        }

        self.rollback_if_empty(run, &adapter, &integration, &campaign, added)
            .await;
        Ok(ChannelVerdict::Completed)
    }

    async fn create_container(
        &self,
        run: &RunContext<'_>,
        adapter: &Arc<dyn ChannelAdapter>,
        integration: &str,
        channel: Channel,
        artifacts: &[QueuedArtifact],
    ) -> std::result::Result<CampaignRef, GuardrailError> {
        let name = format!("{} {} {channel}", run.motion, run.today);
        let tier = artifacts.first().map_or(1, |artifact| artifact.payload.tier);
        let request = ActionRequest::new(Agent::Dispatcher, ActionType::CreateCampaign)
            .with_grounding(GroundingEvidence::new(
                "shared_store",
                run.run_id,
                run.read_at,
            ));
        let target = CallTarget {
            integration,
            channel: None,
            domain: None,
        };

        self.gateway
            .execute(&request, target, || {
                let adapter = Arc::clone(adapter);
                let name = name.clone();
                let channel_name = channel.to_string();
                async move {
                    adapter
                        .create_campaign(&name, tier)
                        .await
                        .map_err(|err| ChannelCallError::Failed {
                            channel: channel_name,
                            operation: "create_campaign".into(),
                            message: format!("{err:#}"),
                        })
                }
            })
            .await
    }

    /// Container creation failed: every artifact queued for the channel
    /// settles without an external call having involved it.
    async fn settle_container_failure(
        &self,
        run: &RunContext<'_>,
        channel: Channel,
        artifacts: &[QueuedArtifact],
        gate_err: &GuardrailError,
        result: &mut DispatchResult,
    ) {
        warn!("could not open a campaign container on {channel}: {gate_err}");
        let circuit_open = matches!(gate_err, GuardrailError::CircuitOpen { .. });
        for artifact in artifacts {
            if circuit_open {
                result.note_skip(SkipReason::CircuitOpen);
                self.log_outcome(
                    run,
                    artifact,
                    None,
                    DispatchOutcome::Skipped {
                        reason: SkipReason::CircuitOpen,
                    },
                )
                .await;
            } else {
                result.failed += 1;
                self.log_outcome(
                    run,
                    artifact,
                    None,
                    DispatchOutcome::Failed {
                        error_code: gate_err.code().to_string(),
                    },
                )
                .await;
            }
        }
    }

    /// Budget or circuit cut the channel short: the current artifact and
    /// everything still queued stay approved for the next cycle.
    async fn defer_rest(
        &self,
        run: &RunContext<'_>,
        current: QueuedArtifact,
        rest: std::vec::IntoIter<QueuedArtifact>,
        reason: SkipReason,
        result: &mut DispatchResult,
    ) {
        result.note_skip(reason);
        self.log_outcome(run, &current, None, DispatchOutcome::Skipped { reason })
            .await;
        for artifact in rest {
            result.note_skip(reason);
            self.log_outcome(run, &artifact, None, DispatchOutcome::Skipped { reason })
                .await;
        }
    }

    /// Post-send bookkeeping. The send already happened, so none of these
    /// failures can be propagated as a dispatch failure; they are logged
    /// loudly and the remaining layers carry the dedup burden.
    async fn settle_sent(
        &self,
        run: &RunContext<'_>,
        artifact: &QueuedArtifact,
        channel: Channel,
        campaign: &CampaignRef,
    ) {
        let recipient_id = &artifact.payload.recipient_id;

        if let Err(err) = self
            .store
            .record_sent(recipient_id, run.today, Utc::now())
            .await
        {
            error!("sent-set update failed for {recipient_id}: {err}");
        }

        if let Err(err) = self
            .store
            .mark_dispatched(&artifact.id, channel, run.today)
            .await
        {
            error!(
                "artifact {} stays approved after a successful send: {err}; \
                 the daily sent-set now prevents a double contact",
                artifact.id
            );
        }

        if let Err(err) = self
            .lifecycle
            .record_dispatch(recipient_id, channel, run.today)
            .await
        {
            warn!("lifecycle callback failed for {recipient_id}: {err}");
        }

        self.log_outcome(run, artifact, Some(&campaign.id), DispatchOutcome::Sent)
            .await;
    }

    async fn rollback_if_empty(
        &self,
        run: &RunContext<'_>,
        adapter: &Arc<dyn ChannelAdapter>,
        integration: &str,
        campaign: &CampaignRef,
        added: u32,
    ) {
        if added > 0 {
            return;
        }
        info!("rolling back empty campaign container {}", campaign.id);

        let request = ActionRequest::new(Agent::Dispatcher, ActionType::RollbackCampaign)
            .with_grounding(GroundingEvidence::new(
                "shared_store",
                run.run_id,
                run.read_at,
            ));
        let target = CallTarget {
            integration,
            channel: None,
            domain: None,
        };
        let outcome = self
            .gateway
            .execute(&request, target, || {
                let adapter = Arc::clone(adapter);
                let campaign = campaign.clone();
                async move {
                    adapter
                        .delete_campaign(&campaign)
                        .await
                        .map_err(|err| ChannelCallError::Failed {
                            channel: campaign.name.clone(),
                            operation: "delete_campaign".into(),
                            message: format!("{err:#}"),
                        })
                }
            })
            .await;
        if let Err(err) = outcome {
            warn!(
                "rollback of empty container {} failed: {err}; it stays behind on the platform",
                campaign.id
            );
        }
    }

    async fn log_outcome(
        &self,
        run: &RunContext<'_>,
        artifact: &QueuedArtifact,
        campaign_id: Option<&str>,
        outcome: DispatchOutcome,
    ) {
        let mut record = DispatchRecord::new(
            run.today,
            run.motion,
            artifact.channel,
            &artifact.payload.recipient_id,
            &artifact.id,
            outcome,
        );
        record.campaign_id = campaign_id.map(str::to_string);
        if let Err(err) = self.log.append(&record).await {
            error!("dispatch log append failed for {}: {err}", artifact.id);
        }
    }
}

/// Pull persisted guard counters into the local view. A failure here is
/// survivable: the local view starts conservative and the store stays
/// authoritative for artifact state.
pub async fn hydrate_guard_state(store: &SharedStateStore, gateway: &GuardrailsGateway) {
    match store
        .get_json::<HashMap<String, DayWindow>>(RATE_WINDOWS_SUFFIX)
        .await
    {
        Ok(Some(windows)) => gateway.limiter().restore(windows),
        Ok(None) => {}
        Err(err) => warn!("rate window hydration failed: {err}; using the local view"),
    }
    match store
        .get_json::<HashMap<String, CircuitSnapshot>>(CIRCUITS_SUFFIX)
        .await
    {
        Ok(Some(snapshots)) => gateway.circuits().restore(snapshots),
        Ok(None) => {}
        Err(err) => warn!("circuit hydration failed: {err}; using the local view"),
    }
}

/// Write the local guard counters back out for the next run (or the next
/// client) to pick up.
pub async fn flush_guard_state(store: &SharedStateStore, gateway: &GuardrailsGateway) {
    if let Err(err) = store
        .put_json(RATE_WINDOWS_SUFFIX, &gateway.limiter().snapshot())
        .await
    {
        warn!("rate window flush failed: {err}");
    }
    if let Err(err) = store
        .put_json(CIRCUITS_SUFFIX, &gateway.circuits().snapshot())
        .await
    {
        warn!("circuit flush failed: {err}");
    }
}
