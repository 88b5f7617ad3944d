use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{RampStep, WarmupConfig};
use crate::error::GuardrailError;

/// Pure warmup arithmetic: calendar date in, day index and ceiling out.
///
/// The ceiling is a function of the day index alone. Nothing here remembers
/// previous answers, so a process restarted mid-ramp computes exactly the
/// same ceilings as one that ran the whole time.
#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    start_date: NaiveDate,
    ramp: Vec<RampStep>,
    steady_state: u32,
}

impl WarmupSchedule {
    #[must_use]
    pub fn new(config: &WarmupConfig) -> Self {
        Self {
            start_date: config.start_date,
            ramp: config.ramp.clone(),
            steady_state: config.steady_state,
        }
    }

    /// 1-based day index. Dates before the start clamp to day 1.
    #[must_use]
    pub fn day_index(&self, today: NaiveDate) -> u32 {
        let days = today.signed_duration_since(self.start_date).num_days() + 1;
        u32::try_from(days.max(1)).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn ceiling_for_day(&self, day_index: u32) -> u32 {
        for step in &self.ramp {
            if day_index <= step.through_day {
                return step.ceiling;
            }
        }
        self.steady_state
    }

    #[must_use]
    pub fn ceiling_on(&self, today: NaiveDate) -> u32 {
        self.ceiling_for_day(self.day_index(today))
    }
}

/// One channel's consumption for one warmup day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub day_index: u32,
    pub count: u32,
}

/// Daily send budget per channel, with a per-domain sub-cap inside a batch.
///
/// Windows roll over lazily: the first consumption on a new day resets the
/// channel's count, so no midnight task exists. Domain counts reset at
/// `begin_batch` and are never persisted.
pub struct RateLimiter {
    schedule: WarmupSchedule,
    domain_batch_cap: u32,
    windows: Mutex<HashMap<String, DayWindow>>,
    batch_domains: Mutex<HashMap<String, u32>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(schedule: WarmupSchedule, domain_batch_cap: u32) -> Self {
        Self {
            schedule,
            domain_batch_cap,
            windows: Mutex::new(HashMap::new()),
            batch_domains: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn schedule(&self) -> &WarmupSchedule {
        &self.schedule
    }

    #[must_use]
    pub fn domain_batch_cap(&self) -> u32 {
        self.domain_batch_cap
    }

    fn lock_windows(&self) -> std::sync::MutexGuard<'_, HashMap<String, DayWindow>> {
        self.windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_batch_domains(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.batch_domains
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start a new dispatch batch: per-domain counts go back to zero.
    pub fn begin_batch(&self) {
        self.lock_batch_domains().clear();
    }

    /// Claim one send on `channel` for `today`, honoring the channel ceiling
    /// and, when a sending domain is known, the per-batch domain cap.
    /// Nothing is consumed on rejection.
    pub fn try_consume(
        &self,
        channel: &str,
        domain: Option<&str>,
        today: NaiveDate,
    ) -> Result<(), GuardrailError> {
        let day_index = self.schedule.day_index(today);
        let ceiling = self.schedule.ceiling_for_day(day_index);

        let mut windows = self.lock_windows();
        let window = windows.entry(channel.to_string()).or_default();
        if window.day_index != day_index {
            *window = DayWindow { day_index, count: 0 };
        }
        if window.count >= ceiling {
            return Err(GuardrailError::RateLimited {
                scope: format!("channel:{channel}"),
                count: window.count,
                ceiling,
            });
        }

        if let Some(domain) = domain {
            let mut batch_domains = self.lock_batch_domains();
            let used = batch_domains.entry(format!("{channel}/{domain}")).or_insert(0);
            if *used >= self.domain_batch_cap {
                return Err(GuardrailError::RateLimited {
                    scope: format!("domain:{domain}"),
                    count: *used,
                    ceiling: self.domain_batch_cap,
                });
            }
            *used += 1;
        }

        window.count += 1;
        Ok(())
    }

    /// Unused budget for `channel` on `today`. Read-only.
    #[must_use]
    pub fn remaining(&self, channel: &str, today: NaiveDate) -> u32 {
        let day_index = self.schedule.day_index(today);
        let ceiling = self.schedule.ceiling_for_day(day_index);
        let windows = self.lock_windows();
        match windows.get(channel) {
            Some(window) if window.day_index == day_index => {
                ceiling.saturating_sub(window.count)
            }
            _ => ceiling,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, DayWindow> {
        self.lock_windows().clone()
    }

    /// Replace local windows with a persisted snapshot. Stale days correct
    /// themselves on the next consumption.
    pub fn restore(&self, windows: HashMap<String, DayWindow>) {
        *self.lock_windows() = windows;
    }
}
