use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString};
use tracing::info;

/// Outbound channels the dispatcher can drive.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    Email,
    Linkedin,
}

/// Handle to a campaign container created on the external platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignRef {
    pub id: String,
    pub name: String,
}

/// Recipient projection passed to channel adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRef {
    pub recipient_id: String,
    pub address: String,
}

/// Outreach platform integration for one channel.
///
/// Every method is an opaque remote call. Callers route them through the
/// guardrails gateway, never directly.
pub trait ChannelAdapter: Send + Sync {
    /// Channel this adapter serves.
    fn channel(&self) -> Channel;

    /// Integration name used for circuit-breaker keying (e.g. "instantly").
    fn integration(&self) -> &str;

    /// Create an empty campaign container for one dispatch batch.
    fn create_campaign<'a>(
        &'a self,
        name: &'a str,
        tier: u8,
    ) -> Pin<Box<dyn Future<Output = Result<CampaignRef>> + Send + 'a>>;

    /// Attach recipients to an existing container.
    fn add_recipients<'a>(
        &'a self,
        campaign: &'a CampaignRef,
        recipients: &'a [RecipientRef],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Remove a container that ended up with no recipients.
    fn delete_campaign<'a>(
        &'a self,
        campaign: &'a CampaignRef,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Log-only adapter — records every call instead of reaching a platform.
///
/// Wired in when no platform credentials are configured, so a deployment can
/// exercise the whole dispatch path before any real integration exists.
pub struct LoggingAdapter {
    channel: Channel,
}

impl LoggingAdapter {
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

impl ChannelAdapter for LoggingAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn integration(&self) -> &str {
        "log_only"
    }

    fn create_campaign<'a>(
        &'a self,
        name: &'a str,
        tier: u8,
    ) -> Pin<Box<dyn Future<Output = Result<CampaignRef>> + Send + 'a>> {
        Box::pin(async move {
            let campaign = CampaignRef {
                id: format!("log-{}", uuid::Uuid::new_v4()),
                name: name.to_string(),
            };
            info!(
                channel = %self.channel,
                campaign_id = %campaign.id,
                tier,
                "log-only campaign created: {name}"
            );
            Ok(campaign)
        })
    }

    fn add_recipients<'a>(
        &'a self,
        campaign: &'a CampaignRef,
        recipients: &'a [RecipientRef],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            for recipient in recipients {
                info!(
                    channel = %self.channel,
                    campaign_id = %campaign.id,
                    recipient_id = %recipient.recipient_id,
                    "log-only dispatch to {}",
                    recipient.address
                );
            }
            Ok(())
        })
    }

    fn delete_campaign<'a>(
        &'a self,
        campaign: &'a CampaignRef,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            info!(
                channel = %self.channel,
                campaign_id = %campaign.id,
                "log-only campaign deleted"
            );
            Ok(())
        })
    }
}

/// Adapter lookup by channel.
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.channel(), adapter);
    }

    #[must_use]
    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    /// Registered channels in stable order.
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.adapters.keys().copied().collect();
        channels.sort();
        channels
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
