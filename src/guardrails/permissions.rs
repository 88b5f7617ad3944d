use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Agent roles that can request actions through the gateway.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Agent {
    Prospector,
    Copywriter,
    Dispatcher,
    Approver,
    Orchestrator,
}

/// Action classes known to the registry. Every externally visible side effect
/// maps to exactly one of these.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionType {
    EnrichLead,
    DraftMessage,
    SendTestMessage,
    UpdateCrm,
    PauseCampaign,
    RollbackCampaign,
    CreateCampaign,
    AddRecipients,
    LaunchCampaign,
    BulkDelete,
    MassUnsubscribe,
    ExportAllData,
}

/// Operation classes rejected before any permission lookup. No registry entry
/// can re-enable these.
pub const BLOCKED_OPERATIONS: [ActionType; 3] = [
    ActionType::BulkDelete,
    ActionType::MassUnsubscribe,
    ActionType::ExportAllData,
];

impl ActionType {
    #[must_use]
    pub fn is_blocked(self) -> bool {
        BLOCKED_OPERATIONS.contains(&self)
    }

    /// Risk the builtin registry assigns to this action for every agent.
    #[must_use]
    pub fn base_risk(self) -> RiskLevel {
        match self {
            Self::EnrichLead | Self::DraftMessage => RiskLevel::Low,
            Self::SendTestMessage
            | Self::UpdateCrm
            | Self::PauseCampaign
            | Self::RollbackCampaign => RiskLevel::Medium,
            Self::CreateCampaign | Self::AddRecipients => RiskLevel::High,
            Self::LaunchCampaign | Self::BulkDelete | Self::MassUnsubscribe
            | Self::ExportAllData => RiskLevel::Critical,
        }
    }
}

/// Ordered risk scale. `High` and above require grounding evidence;
/// `Critical` additionally requires weighted consensus.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    #[must_use]
    pub fn requires_grounding(self) -> bool {
        self >= Self::High
    }

    #[must_use]
    pub fn requires_consensus(self) -> bool {
        self == Self::Critical
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub risk: RiskLevel,
    pub allowed: bool,
}

/// Allow-list over every `(agent, action)` pair.
///
/// The registry is exhaustive by contract: `validate` refuses a table with
/// any pair missing, so a lookup miss at runtime can only mean the wiring
/// changed after startup.
#[derive(Debug, Clone)]
pub struct PermissionRegistry {
    entries: HashMap<(Agent, ActionType), Permission>,
}

impl PermissionRegistry {
    /// The builtin table. Generated from a total match, so it covers the
    /// full cross product by construction.
    #[must_use]
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        for agent in Agent::iter() {
            for action in ActionType::iter() {
                entries.insert((agent, action), builtin_permission(agent, action));
            }
        }
        Self { entries }
    }

    pub fn from_entries(
        entries: impl IntoIterator<Item = ((Agent, ActionType), Permission)>,
    ) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Exhaustiveness check, run once at startup. Missing pairs are a
    /// configuration error and the process must not come up.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        for agent in Agent::iter() {
            for action in ActionType::iter() {
                if !self.entries.contains_key(&(agent, action)) {
                    missing.push(format!("({agent}, {action})"));
                }
            }
        }
        if !missing.is_empty() {
            bail!(
                "permission registry is missing {} entr{}: {}",
                missing.len(),
                if missing.len() == 1 { "y" } else { "ies" },
                missing.join(", ")
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, agent: Agent, action: ActionType) -> Option<Permission> {
        self.entries.get(&(agent, action)).copied()
    }
}

fn builtin_permission(agent: Agent, action: ActionType) -> Permission {
    use ActionType as A;
    let allowed = match action {
        A::EnrichLead => matches!(agent, Agent::Prospector | Agent::Orchestrator),
        A::DraftMessage => matches!(agent, Agent::Copywriter | Agent::Orchestrator),
        A::SendTestMessage => {
            matches!(agent, Agent::Copywriter | Agent::Dispatcher | Agent::Orchestrator)
        }
        A::UpdateCrm => {
            matches!(agent, Agent::Prospector | Agent::Dispatcher | Agent::Orchestrator)
        }
        A::PauseCampaign => {
            matches!(agent, Agent::Dispatcher | Agent::Approver | Agent::Orchestrator)
        }
        A::RollbackCampaign | A::CreateCampaign | A::AddRecipients => {
            matches!(agent, Agent::Dispatcher | Agent::Orchestrator)
        }
        A::LaunchCampaign => matches!(agent, Agent::Orchestrator),
        A::BulkDelete | A::MassUnsubscribe | A::ExportAllData => false,
    };
    Permission {
        risk: action.base_risk(),
        allowed,
    }
}
