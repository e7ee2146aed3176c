//! Destination Policy - per-destination circuit breaker state
//!
//! Every attempt against a destination goes through [`DestinationPolicy::acquire_use`]
//! and ends with exactly one of `record_success`, `record_failure` or `abandon`.
//!
//! ```text
//! Closed --failures >= threshold--> Open --cooldown elapsed, one probe--> HalfOpen
//!   ^                                  ^                                     |
//!   |                                  +-------------probe fails-------------+
//!   +-----------------------------------------------probe succeeds---------+
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wh_config::CircuitBreakerSettings;

use crate::clock::{saturating_add, Clock};
use crate::error::SenderError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Attempts proceed normally
    #[default]
    Closed,
    /// Attempts are rejected until `broken_until`
    Open,
    /// Cooldown elapsed and a single probe attempt is in flight
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open once tripped
    pub cooldown: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&CircuitBreakerSettings> for PolicyConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: Duration::from_secs(settings.cooldown_secs),
        }
    }
}

/// Point-in-time view of a policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySnapshot {
    pub destination_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub broken_until: Option<DateTime<Utc>>,
    pub last_used_at: DateTime<Utc>,
    pub last_success_at: DateTime<Utc>,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct PolicyState {
    circuit: CircuitState,
    consecutive_failures: u32,
    broken_until: Option<DateTime<Utc>>,
    last_used_at: DateTime<Utc>,
    last_success_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DestinationPolicy {
    destination_id: String,
    config: PolicyConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<PolicyState>,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl DestinationPolicy {
    /// New policy in `Closed`; both timestamps start at creation time
    pub fn new(destination_id: impl Into<String>, config: PolicyConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            destination_id: destination_id.into(),
            config,
            clock,
            state: Mutex::new(PolicyState {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
                broken_until: None,
                last_used_at: now,
                last_success_at: now,
            }),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    /// Gate one attempt.
    ///
    /// Rejects with [`SenderError::CircuitOpen`] while the circuit is open or
    /// while a half-open probe is already in flight.
    pub fn acquire_use(&self) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        match state.circuit {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let broken_until = state.broken_until.unwrap_or(now);
                if now < broken_until {
                    drop(state);
                    return Err(self.reject(broken_until));
                }
                state.circuit = CircuitState::HalfOpen;
                debug!(
                    destination_id = %self.destination_id,
                    "Circuit cooldown elapsed, allowing probe"
                );
            }
            CircuitState::HalfOpen => {
                let broken_until = state.broken_until.unwrap_or(now);
                drop(state);
                return Err(self.reject(broken_until));
            }
        }

        state.last_used_at = now;
        Ok(())
    }

    /// Gate one attempt and hold it as a [`PolicyUse`].
    ///
    /// A use dropped without `succeeded` or `failed` is abandoned, so a
    /// half-open probe that never reports back reopens the circuit.
    pub fn begin_use(&self) -> Result<PolicyUse<'_>> {
        self.acquire_use()?;
        Ok(PolicyUse {
            policy: self,
            resolved: false,
        })
    }

    fn reject(&self, broken_until: DateTime<Utc>) -> SenderError {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        SenderError::CircuitOpen {
            destination_id: self.destination_id.clone(),
            broken_until,
        }
    }

    pub fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut state = self.state.lock();

        if state.circuit != CircuitState::Closed {
            info!(
                destination_id = %self.destination_id,
                "Circuit closed after successful probe"
            );
        }

        state.circuit = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.broken_until = None;
        state.last_success_at = now;
    }

    pub fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut state = self.state.lock();

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        let trip = match state.circuit {
            CircuitState::Closed => state.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            let broken_until = saturating_add(now, self.config.cooldown);
            if state.circuit == CircuitState::HalfOpen {
                warn!(
                    destination_id = %self.destination_id,
                    %broken_until,
                    "Circuit re-opened after failed probe"
                );
            } else {
                warn!(
                    destination_id = %self.destination_id,
                    consecutive_failures = state.consecutive_failures,
                    %broken_until,
                    "Circuit opened"
                );
            }
            state.circuit = CircuitState::Open;
            state.broken_until = Some(broken_until);
        }
    }

    /// Release an acquired attempt without counting it either way.
    ///
    /// Used for cancelled attempts and for responses that say nothing about
    /// destination health. A released probe leaves the circuit open with its
    /// elapsed cooldown so the next attempt can probe again.
    pub fn abandon(&self) {
        let mut state = self.state.lock();
        if state.circuit == CircuitState::HalfOpen {
            state.circuit = CircuitState::Open;
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.state.lock().circuit
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.state.lock().last_used_at
    }

    pub fn last_success_at(&self) -> DateTime<Utc> {
        self.state.lock().last_success_at
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        let state = self.state.lock();
        PolicySnapshot {
            destination_id: self.destination_id.clone(),
            state: state.circuit,
            consecutive_failures: state.consecutive_failures,
            broken_until: state.broken_until,
            last_used_at: state.last_used_at,
            last_success_at: state.last_success_at,
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }
}

/// An acquired attempt against a [`DestinationPolicy`]
#[must_use = "dropping the use abandons the attempt"]
#[derive(Debug)]
pub struct PolicyUse<'a> {
    policy: &'a DestinationPolicy,
    resolved: bool,
}

impl PolicyUse<'_> {
    pub fn succeeded(mut self) {
        self.resolved = true;
        self.policy.record_success();
    }

    pub fn failed(mut self) {
        self.resolved = true;
        self.policy.record_failure();
    }
}

impl Drop for PolicyUse<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.policy.abandon();
        }
    }
}
