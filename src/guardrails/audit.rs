use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::Display;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::permissions::{ActionType, Agent, RiskLevel};

/// How a gated action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditResult {
    /// Every check passed and the call succeeded.
    Completed,
    /// A guardrail refused the action; no call was made.
    Rejected,
    /// Checks passed but the call itself failed.
    Failed,
}

/// One line in the audit trail. Written for every request the gateway sees,
/// whatever the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub recorded_at: String,
    pub agent: Agent,
    pub operation: ActionType,
    pub risk_level: RiskLevel,
    pub result: AuditResult,
    #[serde(default)]
    pub grounding_refs: Vec<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(
        agent: Agent,
        operation: ActionType,
        risk_level: RiskLevel,
        result: AuditResult,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            recorded_at: Utc::now().to_rfc3339(),
            agent,
            operation,
            risk_level,
            result,
            grounding_refs: Vec::new(),
            duration_ms: 0,
            error_code: None,
        }
    }
}

/// Append-only audit trail, one JSONL file per UTC day.
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn current_path(&self) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        self.dir.join(format!("{date}.jsonl"))
    }

    pub async fn append(&self, entry: &AuditEntry) -> anyhow::Result<PathBuf> {
        let path = self.current_path();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let line = serde_json::to_string(entry)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(path)
    }
}
