pub mod backend;
pub mod mirror;
pub mod rest;

pub use backend::{MemoryBackend, StateBackend};
pub use mirror::DiskMirror;
pub use rest::RestBackend;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::Channel;
use crate::dispatch::Motion;
use crate::error::StoreError;

/// Queue lifecycle. `rejected` and `dispatched` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Approved,
    Rejected,
    Dispatched,
}

impl ArtifactStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Dispatched)
    }
}

/// The message itself plus the targeting facts dispatch decisions need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub recipient_id: String,
    pub address: String,
    #[serde(default)]
    pub sending_domain: Option<String>,
    /// 1 is the top priority tier.
    pub tier: u8,
    pub motion: Motion,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}

/// One generated outreach artifact in the shared queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedArtifact {
    pub id: String,
    pub status: ArtifactStatus,
    pub channel: Channel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload: ArtifactPayload,
    /// Channel -> date marks left by successful dispatches.
    #[serde(default)]
    pub dispatched_on: BTreeMap<Channel, NaiveDate>,
}

impl QueuedArtifact {
    #[must_use]
    pub fn new(channel: Channel, payload: ArtifactPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: ArtifactStatus::Pending,
            channel,
            created_at: now,
            updated_at: now,
            payload,
            dispatched_on: BTreeMap::new(),
        }
    }

    fn creation_score(&self) -> f64 {
        epoch_score(self.created_at)
    }
}

#[allow(clippy::cast_precision_loss)]
fn epoch_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1_000.0
}

/// Which path produced a queue read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReadSource {
    Index,
    Scan,
    Mirror,
}

/// A queue listing, annotated with the namespace it was read from and how.
#[derive(Debug)]
pub struct QueueBatch {
    pub artifacts: Vec<QueuedArtifact>,
    pub key_prefix: String,
    pub source: ReadSource,
    pub store_reachable: bool,
}

/// Coordination layer over a [`StateBackend`].
///
/// Key schema under the single configured prefix:
///
/// ```text
/// {prefix}:queue:item:{id}      artifact JSON
/// {prefix}:queue:pending_ids    scored set, score = creation epoch seconds
/// {prefix}:queue:approved_ids   same shape, artifacts awaiting dispatch
/// {prefix}:dispatch:sent:{date} recipients dispatched on {date}
/// {prefix}:{suffix}             typed JSON blobs via get_json/put_json
/// ```
///
/// Reads fall back to the disk mirror only when the store is unreachable.
/// Writes never do: a transition that cannot reach the store fails.
pub struct SharedStateStore {
    backend: Arc<dyn StateBackend>,
    mirror: Option<DiskMirror>,
    prefix: String,
}

impl SharedStateStore {
    pub fn new(
        backend: Arc<dyn StateBackend>,
        key_prefix: &str,
        mirror: Option<DiskMirror>,
    ) -> anyhow::Result<Self> {
        let prefix = key_prefix.trim();
        anyhow::ensure!(
            !prefix.is_empty(),
            "refusing to build a state store with an empty key prefix"
        );
        Ok(Self {
            backend,
            mirror,
            prefix: prefix.to_string(),
        })
    }

    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.backend.ping().await
    }

    fn item_key(&self, id: &str) -> String {
        format!("{}:queue:item:{id}", self.prefix)
    }

    fn item_scan_prefix(&self) -> String {
        format!("{}:queue:item:", self.prefix)
    }

    fn pending_key(&self) -> String {
        format!("{}:queue:pending_ids", self.prefix)
    }

    fn approved_key(&self) -> String {
        format!("{}:queue:approved_ids", self.prefix)
    }

    fn sent_key(&self, date: NaiveDate) -> String {
        format!("{}:dispatch:sent:{date}", self.prefix)
    }

    fn data_key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }

    fn parse_artifact(key: &str, json: &str) -> Result<QueuedArtifact, StoreError> {
        serde_json::from_str(json).map_err(|err| StoreError::Corrupt {
            key: key.to_string(),
            message: err.to_string(),
        })
    }

    fn serialize<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
        serde_json::to_string(value).map_err(|err| StoreError::Corrupt {
            key: key.to_string(),
            message: err.to_string(),
        })
    }

    // ─── Queue writes ───────────────────────────────────────────────────

    /// Insert a new artifact and index it when pending.
    pub async fn push(&self, artifact: &QueuedArtifact) -> Result<(), StoreError> {
        let key = self.item_key(&artifact.id);
        let json = Self::serialize(&key, artifact)?;
        self.backend.put(&key, &json).await?;
        if artifact.status == ArtifactStatus::Pending {
            self.backend
                .zadd(&self.pending_key(), &artifact.id, artifact.creation_score())
                .await?;
        }
        if let Some(mirror) = &self.mirror {
            mirror.write(artifact);
        }
        Ok(())
    }

    /// Move an artifact to `new_status`.
    ///
    /// Re-applying the current status is a no-op returning the stored
    /// artifact. Leaving a terminal status is refused. The item write and
    /// both index fixups land as one compound backend operation.
    pub async fn update_status(
        &self,
        id: &str,
        new_status: ArtifactStatus,
    ) -> Result<QueuedArtifact, StoreError> {
        let current = self.get_authoritative(id).await?;
        if current.status == new_status {
            return Ok(current);
        }
        if current.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let mut updated = current;
        updated.status = new_status;
        updated.updated_at = Utc::now();
        self.write_transition(&updated).await?;
        Ok(updated)
    }

    /// Terminal success: status `dispatched` plus the channel/date mark, in
    /// the same write.
    pub async fn mark_dispatched(
        &self,
        id: &str,
        channel: Channel,
        date: NaiveDate,
    ) -> Result<QueuedArtifact, StoreError> {
        let current = self.get_authoritative(id).await?;
        if current.status == ArtifactStatus::Dispatched {
            return Ok(current);
        }
        if current.status == ArtifactStatus::Rejected {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status.to_string(),
                to: ArtifactStatus::Dispatched.to_string(),
            });
        }

        let mut updated = current;
        updated.status = ArtifactStatus::Dispatched;
        updated.dispatched_on.insert(channel, date);
        updated.updated_at = Utc::now();
        self.write_transition(&updated).await?;
        Ok(updated)
    }

    async fn write_transition(&self, artifact: &QueuedArtifact) -> Result<(), StoreError> {
        let key = self.item_key(&artifact.id);
        let json = Self::serialize(&key, artifact)?;

        let mut removals = Vec::new();
        let mut additions = Vec::new();
        match artifact.status {
            ArtifactStatus::Pending => {
                removals.push((self.approved_key(), artifact.id.clone()));
                additions.push((
                    self.pending_key(),
                    artifact.id.clone(),
                    artifact.creation_score(),
                ));
            }
            ArtifactStatus::Approved => {
                removals.push((self.pending_key(), artifact.id.clone()));
                additions.push((
                    self.approved_key(),
                    artifact.id.clone(),
                    artifact.creation_score(),
                ));
            }
            ArtifactStatus::Rejected | ArtifactStatus::Dispatched => {
                removals.push((self.pending_key(), artifact.id.clone()));
                removals.push((self.approved_key(), artifact.id.clone()));
            }
        }

        self.backend
            .transition(&key, &json, &removals, &additions)
            .await?;
        if let Some(mirror) = &self.mirror {
            mirror.write(artifact);
        }
        Ok(())
    }

    // ─── Queue reads ────────────────────────────────────────────────────

    /// Fetch one artifact. Falls back to the disk mirror only when the
    /// store is unreachable, never for a plain miss.
    pub async fn get(&self, id: &str) -> Result<QueuedArtifact, StoreError> {
        let key = self.item_key(id);
        match self.backend.get(&key).await {
            Ok(Some(json)) => Self::parse_artifact(&key, &json),
            Ok(None) => Err(StoreError::NotFound(id.to_string())),
            Err(StoreError::Unavailable(reason)) => {
                if let Some(artifact) = self.mirror.as_ref().and_then(|m| m.read(id)) {
                    info!("store unreachable ({reason}); serving artifact {id} from disk mirror");
                    Ok(artifact)
                } else {
                    Err(StoreError::Unavailable(reason))
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Store-only read used before transitions. Mirror data is never
    /// allowed to seed a write.
    async fn get_authoritative(&self, id: &str) -> Result<QueuedArtifact, StoreError> {
        let key = self.item_key(id);
        match self.backend.get(&key).await? {
            Some(json) => Self::parse_artifact(&key, &json),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Newest-first pending artifacts.
    pub async fn list_pending(&self, limit: usize) -> Result<QueueBatch, StoreError> {
        self.list_indexed(self.pending_key(), ArtifactStatus::Pending, limit)
            .await
    }

    /// Newest-first approved artifacts awaiting dispatch.
    pub async fn list_approved(&self, limit: usize) -> Result<QueueBatch, StoreError> {
        self.list_indexed(self.approved_key(), ArtifactStatus::Approved, limit)
            .await
    }

    async fn list_indexed(
        &self,
        index_key: String,
        want: ArtifactStatus,
        limit: usize,
    ) -> Result<QueueBatch, StoreError> {
        let ids = match self.backend.zrange_desc(&index_key, limit).await {
            Ok(ids) => ids,
            Err(StoreError::Unavailable(reason)) => {
                return self.list_from_mirror(want, limit, &reason);
            }
            Err(other) => return Err(other),
        };

        if ids.is_empty() {
            // An empty index alongside surviving item keys means the index
            // is suspect; rebuild the view from a namespace scan.
            let keys = self.backend.scan(&self.item_scan_prefix()).await?;
            if keys.is_empty() {
                return Ok(QueueBatch {
                    artifacts: Vec::new(),
                    key_prefix: self.prefix.clone(),
                    source: ReadSource::Index,
                    store_reachable: true,
                });
            }
            warn!(
                "{index_key} is empty but {} item keys exist; rebuilding view from scan",
                keys.len()
            );
            let artifacts = self.fetch_filtered(&keys, want, limit).await?;
            return Ok(QueueBatch {
                artifacts,
                key_prefix: self.prefix.clone(),
                source: ReadSource::Scan,
                store_reachable: true,
            });
        }

        let keys: Vec<String> = ids.iter().map(|id| self.item_key(id)).collect();
        let values = self.backend.get_many(&keys).await?;
        let mut artifacts = Vec::new();
        for (index, value) in values.into_iter().enumerate() {
            let id = &ids[index];
            match value {
                None => warn!("{index_key} references missing item {id}"),
                Some(json) => match Self::parse_artifact(&keys[index], &json) {
                    Ok(artifact) if artifact.status == want => artifacts.push(artifact),
                    Ok(artifact) => warn!(
                        "{index_key} lists {id} but its status is {}",
                        artifact.status
                    ),
                    Err(err) => warn!("skipping unreadable artifact {id}: {err}"),
                },
            }
        }
        artifacts.truncate(limit);
        Ok(QueueBatch {
            artifacts,
            key_prefix: self.prefix.clone(),
            source: ReadSource::Index,
            store_reachable: true,
        })
    }

    async fn fetch_filtered(
        &self,
        keys: &[String],
        want: ArtifactStatus,
        limit: usize,
    ) -> Result<Vec<QueuedArtifact>, StoreError> {
        let values = self.backend.get_many(keys).await?;
        let mut artifacts = Vec::new();
        for (index, value) in values.into_iter().enumerate() {
            let Some(json) = value else { continue };
            match Self::parse_artifact(&keys[index], &json) {
                Ok(artifact) if artifact.status == want => artifacts.push(artifact),
                Ok(_) => {}
                Err(err) => warn!("skipping unreadable key {}: {err}", keys[index]),
            }
        }
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        artifacts.truncate(limit);
        Ok(artifacts)
    }

    fn list_from_mirror(
        &self,
        want: ArtifactStatus,
        limit: usize,
        reason: &str,
    ) -> Result<QueueBatch, StoreError> {
        let Some(mirror) = &self.mirror else {
            return Err(StoreError::Unavailable(reason.to_string()));
        };
        warn!("store unreachable ({reason}); serving {want} artifacts from disk mirror");

        let mut artifacts: Vec<QueuedArtifact> = mirror
            .list()
            .into_iter()
            .filter(|artifact| artifact.status == want)
            .collect();
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        artifacts.truncate(limit);
        Ok(QueueBatch {
            artifacts,
            key_prefix: self.prefix.clone(),
            source: ReadSource::Mirror,
            store_reachable: false,
        })
    }

    // ─── Dispatch coordination records ──────────────────────────────────

    pub async fn already_sent_today(
        &self,
        recipient_id: &str,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        Ok(self
            .backend
            .zscore(&self.sent_key(date), recipient_id)
            .await?
            .is_some())
    }

    pub async fn record_sent(
        &self,
        recipient_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.backend
            .zadd(&self.sent_key(date), recipient_id, epoch_score(now))
            .await
    }

    // ─── Typed JSON blobs ───────────────────────────────────────────────

    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        suffix: &str,
    ) -> Result<Option<T>, StoreError> {
        let key = self.data_key(suffix);
        match self.backend.get(&key).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|err| StoreError::Corrupt {
                    key,
                    message: err.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(
        &self,
        suffix: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let key = self.data_key(suffix);
        let json = Self::serialize(&key, value)?;
        self.backend.put(&key, &json).await
    }
}
