use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FleetpostError, GuardrailError};
use crate::store::SharedStateStore;

/// Content hash binding an approval to the exact batch it covers.
///
/// Order-insensitive: the same set of artifact ids hashes identically
/// however the batch was assembled.
#[must_use]
pub fn batch_hash(artifact_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = artifact_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Stored form of one approval token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTokenRecord {
    pub token: String,
    pub batch_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Issues and redeems single-use, time-bound batch approval tokens.
///
/// Cancellation needs no dedicated signal: the approval surface rewrites or
/// expires the stored record, and the next `recheck` fails.
pub struct ApprovalGate<'a> {
    store: &'a SharedStateStore,
    ttl: Duration,
}

impl<'a> ApprovalGate<'a> {
    #[must_use]
    pub fn new(store: &'a SharedStateStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn token_suffix(token: &str) -> String {
        format!("approval:token:{token}")
    }

    /// Mint a token for the batch and persist it unredeemed.
    pub async fn issue(
        &self,
        artifact_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<ApprovalTokenRecord, FleetpostError> {
        let record = ApprovalTokenRecord {
            token: generate_token(),
            batch_hash: batch_hash(artifact_ids),
            issued_at: now,
            expires_at: now + self.ttl,
            used: false,
            run_id: None,
        };
        self.store
            .put_json(&Self::token_suffix(&record.token), &record)
            .await?;
        Ok(record)
    }

    /// Redeem a token at the start of a batch run.
    ///
    /// Single use: the winning run stamps its id into the record, and every
    /// later redemption attempt fails whole-batch.
    pub async fn consume(
        &self,
        token: &str,
        artifact_ids: &[String],
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), FleetpostError> {
        let suffix = Self::token_suffix(token);
        let Some(mut record) = self.store.get_json::<ApprovalTokenRecord>(&suffix).await? else {
            return Err(rejected("unknown token"));
        };
        if record.used {
            return Err(rejected("token already used"));
        }
        if now >= record.expires_at {
            return Err(rejected(&format!(
                "token expired at {}",
                record.expires_at.to_rfc3339()
            )));
        }
        if batch_hash(artifact_ids) != record.batch_hash {
            return Err(rejected("batch contents changed since approval"));
        }

        record.used = true;
        record.run_id = Some(run_id.to_string());
        self.store.put_json(&suffix, &record).await?;
        Ok(())
    }

    /// Confirm mid-batch that the token is still valid and still bound to
    /// this run. Called before every dispatch attempt inside a token-bound
    /// batch.
    pub async fn recheck(
        &self,
        token: &str,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), FleetpostError> {
        let suffix = Self::token_suffix(token);
        let Some(record) = self.store.get_json::<ApprovalTokenRecord>(&suffix).await? else {
            return Err(rejected("token revoked"));
        };
        if now >= record.expires_at {
            return Err(rejected("token expired mid-batch"));
        }
        if !record.used || record.run_id.as_deref() != Some(run_id) {
            return Err(rejected("token no longer bound to this run"));
        }
        Ok(())
    }
}

fn rejected(reason: &str) -> FleetpostError {
    GuardrailError::ExpiredApproval {
        reason: reason.to_string(),
    }
    .into()
}

fn generate_token() -> String {
    use rand::RngCore;
    let mut buf = [0u8; 32];
    rand::rng().fill_bytes(&mut buf);
    format!("fp_{}", hex::encode(buf))
}
