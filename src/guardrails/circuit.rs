use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use strum::Display;
use tracing::{info, warn};

use crate::error::GuardrailError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Persistable view of one circuit. The probe flag is deliberately absent:
/// a restored process starts with no probe in flight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Per-integration circuit breaker.
///
/// There is no background task: expiry is evaluated lazily whenever a caller
/// asks to be admitted, so an idle process carries no timers. Callers supply
/// `now` on every call.
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, Circuit>>,
    trip_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(trip_threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            trip_threshold,
            cooldown: Duration::seconds(i64::try_from(cooldown_secs).unwrap_or(i64::MAX)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Decide whether a call to `integration` may proceed right now.
    ///
    /// An open circuit past its cool-down flips to half-open and admits
    /// exactly one probe; every other caller keeps failing until that probe
    /// reports back.
    pub fn admit(&self, integration: &str, now: DateTime<Utc>) -> Result<(), GuardrailError> {
        let mut circuits = self.lock();
        let circuit = circuits.entry(integration.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = circuit.opened_at.unwrap_or(now);
                let elapsed = now.signed_duration_since(opened_at);
                if elapsed >= self.cooldown {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_in_flight = true;
                    info!("circuit for {integration} half-open after cool-down, admitting probe");
                    Ok(())
                } else {
                    Err(GuardrailError::CircuitOpen {
                        integration: integration.to_string(),
                        remaining_secs: (self.cooldown - elapsed).num_seconds(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    Err(GuardrailError::CircuitOpen {
                        integration: integration.to_string(),
                        remaining_secs: 0,
                    })
                } else {
                    circuit.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn record_success(&self, integration: &str) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(integration.to_string()).or_default();
        if circuit.state != CircuitState::Closed {
            info!("circuit for {integration} closed after successful probe");
        }
        *circuit = Circuit::default();
    }

    pub fn record_failure(&self, integration: &str, now: DateTime<Utc>) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(integration.to_string()).or_default();
        circuit.probe_in_flight = false;

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                warn!("circuit probe for {integration} failed, cool-down restarts");
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                circuit.failure_count = circuit.failure_count.saturating_add(1);
                if circuit.failure_count >= self.trip_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(now);
                    warn!(
                        "circuit for {integration} opened after {} consecutive failures",
                        circuit.failure_count
                    );
                }
            }
        }
    }

    /// Give back a claimed probe slot without recording an outcome. Used
    /// when a later check rejects the call before it was made.
    pub fn release_probe(&self, integration: &str) {
        let mut circuits = self.lock();
        if let Some(circuit) = circuits.get_mut(integration) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.probe_in_flight = false;
            }
        }
    }

    /// Effective state for observation. An open circuit past its cool-down
    /// reports half-open, but observing never claims the probe slot.
    #[must_use]
    pub fn state(&self, integration: &str, now: DateTime<Utc>) -> CircuitState {
        let mut circuits = self.lock();
        let Some(circuit) = circuits.get_mut(integration) else {
            return CircuitState::Closed;
        };
        if circuit.state == CircuitState::Open {
            let opened_at = circuit.opened_at.unwrap_or(now);
            if now.signed_duration_since(opened_at) >= self.cooldown {
                circuit.state = CircuitState::HalfOpen;
            }
        }
        circuit.state
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, CircuitSnapshot> {
        self.lock()
            .iter()
            .map(|(integration, circuit)| {
                (integration.clone(), CircuitSnapshot {
                    state: circuit.state,
                    failure_count: circuit.failure_count,
                    opened_at: circuit.opened_at,
                })
            })
            .collect()
    }

    /// Replace local state with a persisted snapshot.
    pub fn restore(&self, snapshots: HashMap<String, CircuitSnapshot>) {
        let mut circuits = self.lock();
        circuits.clear();
        for (integration, snapshot) in snapshots {
            circuits.insert(integration, Circuit {
                state: snapshot.state,
                failure_count: snapshot.failure_count,
                opened_at: snapshot.opened_at,
                probe_in_flight: false,
            });
        }
    }
}
