use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use super::Motion;
use super::dedup::SkipReason;
use crate::channels::Channel;

/// Final word on one recipient within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent,
    Failed { error_code: String },
    Skipped { reason: SkipReason },
}

/// One line in the dispatch log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub recorded_at: String,
    pub date: NaiveDate,
    pub motion: Motion,
    pub channel: Channel,
    pub recipient_id: String,
    pub artifact_id: String,
    /// The identifiers the three dedup layers keyed this send on.
    pub dedup_keys: Vec<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

impl DispatchRecord {
    #[must_use]
    pub fn new(
        date: NaiveDate,
        motion: Motion,
        channel: Channel,
        recipient_id: &str,
        artifact_id: &str,
        outcome: DispatchOutcome,
    ) -> Self {
        Self {
            recorded_at: Utc::now().to_rfc3339(),
            date,
            motion,
            channel,
            recipient_id: recipient_id.to_string(),
            artifact_id: artifact_id.to_string(),
            dedup_keys: vec![
                format!("daily:{recipient_id}@{date}"),
                format!("lifecycle:{recipient_id}"),
                format!("artifact:{artifact_id}:{channel}@{date}"),
            ],
            campaign_id: None,
            outcome,
        }
    }
}

/// Append-only dispatch log, one JSONL file per batch date.
pub struct DispatchLog {
    dir: PathBuf,
}

impl DispatchLog {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn append(&self, record: &DispatchRecord) -> anyhow::Result<PathBuf> {
        let path = self.dir.join(format!("{}.jsonl", record.date));

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let line = serde_json::to_string(record)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(path)
    }
}
