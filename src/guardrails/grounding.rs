use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::permissions::{ActionType, RiskLevel};
use crate::error::GuardrailError;

/// Proof that the data behind an action traces to a recently verified source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingEvidence {
    pub source: String,
    pub data_id: String,
    pub verified_at: DateTime<Utc>,
}

impl GroundingEvidence {
    pub fn new(
        source: impl Into<String>,
        data_id: impl Into<String>,
        verified_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            data_id: data_id.into(),
            verified_at,
        }
    }

    /// Compact form recorded in audit entries.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}:{}", self.source, self.data_id)
    }
}

/// Enforces the freshness window on grounding evidence for high-risk actions.
#[derive(Debug, Clone, Copy)]
pub struct GroundingValidator {
    freshness_secs: u64,
}

impl GroundingValidator {
    #[must_use]
    pub fn new(freshness_secs: u64) -> Self {
        Self { freshness_secs }
    }

    /// Validate evidence against the risk level. Returns the audit reference
    /// when evidence was attached; risk levels below `High` pass with or
    /// without it.
    ///
    /// The caller supplies `now` so checks stay deterministic under test.
    pub fn check(
        &self,
        action: ActionType,
        risk: RiskLevel,
        evidence: Option<&GroundingEvidence>,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, GuardrailError> {
        if !risk.requires_grounding() {
            return Ok(evidence.map(GroundingEvidence::reference));
        }

        let Some(evidence) = evidence else {
            return Err(reject(action, "no grounding evidence attached"));
        };
        if evidence.source.trim().is_empty() {
            return Err(reject(action, "evidence source is empty"));
        }
        if evidence.data_id.trim().is_empty() {
            return Err(reject(action, "evidence data_id is empty"));
        }

        let age_secs = now.signed_duration_since(evidence.verified_at).num_seconds();
        if age_secs < 0 {
            return Err(reject(action, "evidence verified_at is in the future"));
        }
        let age_secs = u64::try_from(age_secs).unwrap_or(u64::MAX);
        if age_secs > self.freshness_secs {
            return Err(reject(
                action,
                &format!(
                    "evidence is {age_secs}s old (freshness window is {}s)",
                    self.freshness_secs
                ),
            ));
        }

        Ok(Some(evidence.reference()))
    }
}

fn reject(action: ActionType, reason: &str) -> GuardrailError {
    GuardrailError::GroundingMissing {
        action: action.to_string(),
        reason: reason.to_string(),
    }
}
