use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use strum::{Display, EnumString};

use crate::channels::Channel;

/// Where a recipient stands with us. Anything but `active` permanently
/// excludes the recipient from dispatch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleStatus {
    Active,
    Bounced,
    Unsubscribed,
    Suppressed,
}

impl LifecycleStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Recipient status source, typically backed by a CRM.
pub trait RecipientLifecycle: Send + Sync {
    fn get_status<'a>(
        &'a self,
        recipient_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<LifecycleStatus>> + Send + 'a>>;

    /// Callback after a successful dispatch so the source can advance its
    /// own cadence state.
    fn record_dispatch<'a>(
        &'a self,
        recipient_id: &'a str,
        channel: Channel,
        date: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Stand-in when no lifecycle source is wired: everyone is active and
/// callbacks are dropped.
pub struct StaticLifecycle;

impl RecipientLifecycle for StaticLifecycle {
    fn get_status<'a>(
        &'a self,
        _recipient_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<LifecycleStatus>> + Send + 'a>> {
        Box::pin(async { Ok(LifecycleStatus::Active) })
    }

    fn record_dispatch<'a>(
        &'a self,
        _recipient_id: &'a str,
        _channel: Channel,
        _date: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}
