use anyhow::{Context, Result};
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::channels::{AdapterRegistry, LoggingAdapter};
use crate::cli::{Cli, Commands, QueueCommands};
use crate::config::Config;
use crate::dispatch::{
    CoordinatorOptions, DispatchCoordinator, DispatchLog, DispatchResult, Motion,
    hydrate_guard_state,
};
use crate::guardrails::{
    AuditLog, CircuitBreaker, GroundingValidator, GuardrailsGateway, PermissionRegistry,
    RateLimiter, WarmupSchedule,
};
use crate::lifecycle::{RecipientLifecycle, StaticLifecycle};
use crate::store::{
    ArtifactStatus, DiskMirror, MemoryBackend, QueueBatch, ReadSource, RestBackend,
    SharedStateStore, StateBackend,
};

/// Route one parsed invocation to its handler.
pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Dispatch {
            motion,
            dry_run,
            token,
        } => run_dispatch(&config, &motion, dry_run, token.as_deref()).await,

        Commands::Queue { queue_command } => match queue_command {
            QueueCommands::List { limit, approved } => queue_list(&config, limit, approved).await,
            QueueCommands::Approve { id } => {
                queue_set_status(&config, &id, ArtifactStatus::Approved).await
            }
            QueueCommands::Reject { id } => {
                queue_set_status(&config, &id, ArtifactStatus::Rejected).await
            }
        },

        Commands::Status => show_status(&config).await,
    }
}

// ─── Wiring ─────────────────────────────────────────────────────────────────

fn build_backend(config: &Config) -> Arc<dyn StateBackend> {
    if let (Some(url), Some(token)) = (config.store.url.as_deref(), config.store.token.as_deref())
    {
        Arc::new(RestBackend::new(url, token, config.store.request_timeout_ms))
    } else {
        info!("store.url is not set; state lives in process memory and vanishes on exit");
        Arc::new(MemoryBackend::new())
    }
}

fn build_store(config: &Config) -> Result<SharedStateStore> {
    let mirror = DiskMirror::new(config.mirror_dir());
    SharedStateStore::new(build_backend(config), &config.store.key_prefix, Some(mirror))
}

fn build_gateway(config: &Config) -> Result<GuardrailsGateway> {
    let registry = PermissionRegistry::builtin();
    registry
        .validate()
        .context("permission registry is incomplete")?;
    Ok(GuardrailsGateway::new(
        registry,
        GroundingValidator::new(config.grounding.freshness_secs),
        CircuitBreaker::new(config.circuit.trip_threshold, config.circuit.cooldown_secs),
        RateLimiter::new(
            WarmupSchedule::new(&config.warmup),
            config.warmup.domain_batch_cap,
        ),
        AuditLog::new(config.audit_dir()),
        Duration::from_millis(config.dispatch.call_timeout_ms),
    ))
}

/// Log-only adapters until platform credentials land in config.
fn build_adapters(options: &CoordinatorOptions) -> AdapterRegistry {
    let mut adapters = AdapterRegistry::new();
    for channel in &options.enabled_channels {
        adapters.register(Arc::new(LoggingAdapter::new(*channel)));
    }
    adapters
}

// ─── dispatch ───────────────────────────────────────────────────────────────

async fn run_dispatch(
    config: &Config,
    motion: &str,
    dry_run: bool,
    token: Option<&str>,
) -> Result<()> {
    let motion = Motion::from_str(motion).map_err(|_| {
        anyhow::anyhow!("unknown motion {motion:?} (expected primary, follow_up, or revival)")
    })?;

    let store = Arc::new(build_store(config)?);
    let gateway = Arc::new(build_gateway(config)?);
    let options = CoordinatorOptions::from_config(config);
    let adapters = Arc::new(build_adapters(&options));
    let lifecycle: Arc<dyn RecipientLifecycle> = Arc::new(StaticLifecycle);
    let log = DispatchLog::new(config.dispatch_log_dir());

    let coordinator = DispatchCoordinator::new(store, gateway, adapters, lifecycle, log, options);
    let result = coordinator.run_with_token(motion, dry_run, token).await?;
    println!("{}", render_result(&result));
    Ok(())
}

fn render_result(result: &DispatchResult) -> String {
    let mut lines = vec![
        format!(
            "◆ Dispatch {} {}{}",
            result.motion,
            result.date,
            if result.dry_run { " (dry run)" } else { "" }
        ),
        String::new(),
        format!("  sent     {}", result.sent),
        format!("  failed   {}", result.failed),
        format!("  skipped  {}", result.total_skipped()),
    ];
    for (reason, count) in &result.skipped {
        lines.push(format!("    {reason}: {count}"));
    }
    if !result.per_channel.is_empty() {
        lines.push(String::new());
        for (channel, count) in &result.per_channel {
            lines.push(format!("  {channel}: {count} sent"));
        }
    }
    if let Some(halted) = &result.halted {
        lines.push(String::new());
        lines.push(format!("  batch halted: {halted}"));
    }
    if let Some(token) = &result.token {
        lines.push(String::new());
        lines.push(format!("  approval token: {token}"));
        lines.push(format!(
            "  redeem with: fleetpost dispatch --motion {} --token {token}",
            result.motion
        ));
    }
    lines.join("\n")
}

// ─── queue ──────────────────────────────────────────────────────────────────

async fn queue_list(config: &Config, limit: usize, approved: bool) -> Result<()> {
    let store = build_store(config)?;
    let batch = if approved {
        store.list_approved(limit).await?
    } else {
        store.list_pending(limit).await?
    };
    println!("{}", render_queue(&batch, approved));
    Ok(())
}

fn render_queue(batch: &QueueBatch, approved: bool) -> String {
    let mut lines = vec![format!(
        "◆ {} queue ({})",
        if approved { "Approved" } else { "Pending" },
        batch.key_prefix
    )];
    match batch.source {
        ReadSource::Index => {}
        ReadSource::Scan => {
            lines.push("  (index was empty; listing rebuilt from a key scan)".into());
        }
        ReadSource::Mirror => {
            lines.push(
                "  (shared store unreachable; showing the local mirror, review only)".into(),
            );
        }
    }
    lines.push(String::new());
    if batch.artifacts.is_empty() {
        lines.push("  (empty)".into());
    }
    for artifact in &batch.artifacts {
        lines.push(format!(
            "  {}  {}  tier {}  {}  {}  {}",
            artifact.id,
            artifact.channel,
            artifact.payload.tier,
            artifact.payload.motion,
            artifact.payload.address,
            artifact.created_at.format("%Y-%m-%d %H:%M"),
        ));
    }
    lines.join("\n")
}

async fn queue_set_status(config: &Config, id: &str, status: ArtifactStatus) -> Result<()> {
    let store = build_store(config)?;
    let artifact = store.update_status(id, status).await?;
    println!("{} is now {}", artifact.id, artifact.status);
    Ok(())
}

// ─── status ─────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_lines)]
async fn show_status(config: &Config) -> Result<()> {
    let store = build_store(config)?;
    let gateway = build_gateway(config)?;
    hydrate_guard_state(&store, &gateway).await;

    let now = Utc::now();
    let today = now.date_naive();
    let reachable = match store.ping().await {
        Ok(()) => "reachable".to_string(),
        Err(err) => format!("unreachable: {err}"),
    };

    let mut lines = vec![
        "◆ Fleetpost status".to_string(),
        String::new(),
        format!("  version    {}", env!("CARGO_PKG_VERSION")),
        format!("  config     {}", config.config_path.display()),
        format!("  store      {} ({reachable})", store.backend_name()),
        format!("  prefix     {}", store.key_prefix()),
        String::new(),
    ];

    let schedule = gateway.limiter().schedule();
    lines.push(format!(
        "  warmup     day {} (started {})",
        schedule.day_index(today),
        config.warmup.start_date
    ));
    lines.push(format!(
        "  ceiling    {} per channel, {} per domain per batch",
        schedule.ceiling_on(today),
        gateway.limiter().domain_batch_cap()
    ));
    let options = CoordinatorOptions::from_config(config);
    for channel in &options.enabled_channels {
        lines.push(format!(
            "    {channel}: {} remaining today",
            gateway.limiter().remaining(&channel.to_string(), today)
        ));
    }

    lines.push(String::new());
    lines.push("  circuits".to_string());
    let snapshots = gateway.circuits().snapshot();
    if snapshots.is_empty() {
        lines.push("    (none tracked)".into());
    } else {
        let mut names: Vec<&String> = snapshots.keys().collect();
        names.sort();
        for name in names {
            lines.push(format!(
                "    {name}: {}",
                gateway.circuits().state(name, now)
            ));
        }
    }

    lines.push(String::new());
    lines.push("  queue".to_string());
    match store.list_pending(config.dispatch.batch_limit).await {
        Ok(batch) => lines.push(format!("    pending   {}", batch.artifacts.len())),
        Err(err) => lines.push(format!("    pending   unavailable: {err}")),
    }
    match store.list_approved(config.dispatch.batch_limit).await {
        Ok(batch) => lines.push(format!("    approved  {}", batch.artifacts.len())),
        Err(err) => lines.push(format!("    approved  unavailable: {err}")),
    }

    lines.push(String::new());
    if config.approval.require_token {
        lines.push(format!(
            "  approval   token required (ttl {}s)",
            config.approval.token_ttl_secs
        ));
    } else {
        lines.push("  approval   token not required".to_string());
    }

    println!("{}", lines.join("\n"));
    Ok(())
}
