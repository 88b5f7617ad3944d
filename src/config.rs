use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration, loaded from exactly one TOML file.
///
/// There is no environment-variable layer and no fallback chain: the file
/// named on the command line (or `~/.fleetpost/config.toml`) is the single
/// source of truth, and a missing or invalid file is a startup error rather
/// than a silently-defaulted run. `key_prefix` and `warmup.start_date` have
/// no defaults on purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path the config was loaded from - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Data directory for mirrors and logs - computed, not serialized
    #[serde(skip)]
    pub base_dir: PathBuf,

    pub store: StoreConfig,

    pub warmup: WarmupConfig,

    #[serde(default)]
    pub grounding: GroundingConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

// ─── Shared state store ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// REST endpoint of the shared store. Absent means in-process memory
    /// backend (single-host development only).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Namespace prefix for every key this deployment writes. Required.
    pub key_prefix: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Override for the local disk mirror directory.
    #[serde(default)]
    pub mirror_dir: Option<String>,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        let prefix = self.key_prefix.trim();
        if prefix.is_empty() {
            bail!("store.key_prefix must not be empty");
        }
        if prefix != self.key_prefix {
            bail!("store.key_prefix must not contain leading or trailing whitespace");
        }
        if prefix.ends_with(':') {
            bail!("store.key_prefix must not end with ':' (the separator is added per key)");
        }
        if self.request_timeout_ms == 0 {
            bail!("store.request_timeout_ms must be at least 1");
        }
        if self.url.is_some() && self.token.is_none() {
            bail!("store.token is required when store.url is set");
        }
        Ok(())
    }
}

// ─── Warmup ramp / rate limits ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    /// First day of the warmup, ISO date string ("2026-08-01"). Day index 1.
    pub start_date: NaiveDate,
    #[serde(default = "default_ramp")]
    pub ramp: Vec<RampStep>,
    #[serde(default = "default_steady_state")]
    pub steady_state: u32,
    /// Maximum recipients per sending domain within one batch.
    #[serde(default = "default_domain_batch_cap")]
    pub domain_batch_cap: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampStep {
    pub through_day: u32,
    pub ceiling: u32,
}

fn default_ramp() -> Vec<RampStep> {
    vec![
        RampStep { through_day: 7, ceiling: 5 },
        RampStep { through_day: 14, ceiling: 10 },
        RampStep { through_day: 21, ceiling: 15 },
    ]
}

fn default_steady_state() -> u32 {
    25
}

fn default_domain_batch_cap() -> u32 {
    5
}

impl WarmupConfig {
    fn validate(&self) -> Result<()> {
        if self.steady_state == 0 {
            bail!("warmup.steady_state must be at least 1");
        }
        if self.domain_batch_cap == 0 {
            bail!("warmup.domain_batch_cap must be at least 1");
        }
        let mut last_day = 0u32;
        let mut last_ceiling = 0u32;
        for step in &self.ramp {
            if step.through_day <= last_day {
                bail!(
                    "warmup.ramp steps must have strictly increasing through_day (got {} after {last_day})",
                    step.through_day
                );
            }
            if step.ceiling == 0 {
                bail!("warmup.ramp ceilings must be at least 1");
            }
            if step.ceiling < last_ceiling {
                bail!(
                    "warmup.ramp ceilings must never decrease (got {} after {last_ceiling})",
                    step.ceiling
                );
            }
            last_day = step.through_day;
            last_ceiling = step.ceiling;
        }
        if last_ceiling > self.steady_state {
            bail!(
                "warmup.steady_state ({}) must be at least the final ramp ceiling ({last_ceiling})",
                self.steady_state
            );
        }
        Ok(())
    }
}

// ─── Grounding freshness ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingConfig {
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
}

fn default_freshness_secs() -> u64 {
    3_600
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            freshness_secs: default_freshness_secs(),
        }
    }
}

// ─── Circuit breaker ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_trip_threshold")]
    pub trip_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_trip_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    300
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            trip_threshold: default_trip_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

// ─── Approval tokens ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// When set, `dispatch` refuses to run without a valid single-use token.
    #[serde(default)]
    pub require_token: bool,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

fn default_token_ttl_secs() -> u64 {
    900
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            require_token: false,
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

// ─── Dispatch runs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Upper bound on artifacts read from the queue per run.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// Override for the dispatch log directory.
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_batch_limit() -> usize {
    500
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            batch_limit: default_batch_limit(),
            log_dir: None,
        }
    }
}

// ─── Channels ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_true")]
    pub email: bool,
    #[serde(default = "default_true")]
    pub linkedin: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            email: true,
            linkedin: true,
        }
    }
}

// ─── Audit trail ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditConfig {
    /// Override for the audit trail directory.
    #[serde(default)]
    pub dir: Option<String>,
}

// ─── Loading ────────────────────────────────────────────────────────────────

impl Config {
    /// Load and validate the config file. `explicit` wins over the default
    /// location; there is no other source.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_path = match explicit {
            Some(path) => PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned()),
            None => Self::default_path()?,
        };

        let contents = fs::read_to_string(&config_path).with_context(|| {
            format!(
                "failed to read config file {} (create it; key_prefix and warmup.start_date are required)",
                config_path.display()
            )
        })?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", config_path.display()))?;

        config.config_path.clone_from(&config_path);
        config.base_dir = Self::home_root()?;
        fs::create_dir_all(&config.base_dir).context("failed to create data directory")?;

        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::home_root()?.join("config.toml"))
    }

    fn home_root() -> Result<PathBuf> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("could not find home directory")?;
        Ok(home.join(".fleetpost"))
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.warmup.validate()?;
        if self.grounding.freshness_secs == 0 {
            bail!("grounding.freshness_secs must be at least 1");
        }
        if self.circuit.trip_threshold == 0 {
            bail!("circuit.trip_threshold must be at least 1");
        }
        if self.circuit.cooldown_secs == 0 {
            bail!("circuit.cooldown_secs must be at least 1");
        }
        if self.approval.token_ttl_secs == 0 {
            bail!("approval.token_ttl_secs must be at least 1");
        }
        if self.dispatch.call_timeout_ms == 0 {
            bail!("dispatch.call_timeout_ms must be at least 1");
        }
        if self.dispatch.batch_limit == 0 {
            bail!("dispatch.batch_limit must be at least 1");
        }
        Ok(())
    }

    pub fn mirror_dir(&self) -> PathBuf {
        Self::resolve_dir(self.store.mirror_dir.as_deref(), &self.base_dir, "mirror")
    }

    pub fn dispatch_log_dir(&self) -> PathBuf {
        Self::resolve_dir(self.dispatch.log_dir.as_deref(), &self.base_dir, "dispatch-log")
    }

    pub fn audit_dir(&self) -> PathBuf {
        Self::resolve_dir(self.audit.dir.as_deref(), &self.base_dir, "audit")
    }

    fn resolve_dir(overridden: Option<&str>, base: &Path, default_name: &str) -> PathBuf {
        match overridden {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).into_owned()),
            None => base.join(default_name),
        }
    }
}
