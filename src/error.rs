use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `Fleetpost`.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum FleetpostError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Guardrails / Policy ─────────────────────────────────────────────
    #[error("guardrail: {0}")]
    Guardrail(#[from] GuardrailError),

    // ── Shared state store ──────────────────────────────────────────────
    #[error("store: {0}")]
    Store(#[from] StoreError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Guardrail errors ───────────────────────────────────────────────────────

/// Rejection and failure taxonomy surfaced by the guardrails gateway.
///
/// Every variant carries enough context for an operator to act on without
/// reading the audit trail. `retryable` distinguishes transient conditions
/// (wait and re-run) from configuration or policy errors (fix and re-run).
#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("operation {operation} is blocked by security policy: no permission entry can override it")]
    BlockedOperation { operation: String },

    #[error("agent {agent} is not permitted to perform {action}")]
    PermissionDenied { agent: String, action: String },

    #[error("no permission entry for ({agent}, {action}): registry wiring is incomplete")]
    ContractViolation { agent: String, action: String },

    #[error("grounding for {action} rejected: {reason}")]
    GroundingMissing { action: String, reason: String },

    #[error("{action} lacks consensus: {approved_weight}/{total_weight} weighted votes (two thirds required)")]
    PendingApproval {
        action: String,
        approved_weight: u32,
        total_weight: u32,
    },

    #[error("circuit for {integration} is open ({remaining_secs}s of cool-down remaining)")]
    CircuitOpen {
        integration: String,
        remaining_secs: i64,
    },

    #[error("rate limit reached for {scope}: {count}/{ceiling}")]
    RateLimited {
        scope: String,
        count: u32,
        ceiling: u32,
    },

    #[error("channel call failed: {0}")]
    Channel(#[from] ChannelCallError),

    #[error("approval token rejected: {reason}")]
    ExpiredApproval { reason: String },
}

impl GuardrailError {
    /// Whether re-running the same action later can succeed without any
    /// configuration or policy change.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RateLimited { .. } | Self::Channel(_)
        )
    }

    /// Stable machine-readable code for audit entries and dispatch records.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BlockedOperation { .. } => "blocked_operation",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::ContractViolation { .. } => "contract_violation",
            Self::GroundingMissing { .. } => "grounding_missing",
            Self::PendingApproval { .. } => "pending_approval",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimited { .. } => "rate_limited",
            Self::Channel(_) => "channel_call",
            Self::ExpiredApproval { .. } => "expired_approval",
        }
    }
}

// ─── Channel call errors ────────────────────────────────────────────────────

/// Failure of an actual outbound call, after every guardrail check passed.
#[derive(Debug, Error)]
pub enum ChannelCallError {
    #[error("{channel} {operation} failed: {message}")]
    Failed {
        channel: String,
        operation: String,
        message: String,
    },

    #[error("{channel} {operation} timed out after {timeout_ms}ms")]
    Timeout {
        channel: String,
        operation: String,
        timeout_ms: u64,
    },
}

// ─── Store errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unreachable: {0}")]
    Unavailable(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("artifact {id} cannot move {from} -> {to}: {from} is terminal")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("malformed record under {key}: {message}")]
    Corrupt { key: String, message: String },
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, FleetpostError>;
