//! Per-provider circuit breaker.
//!
//! Tracks failure/success history per provider name and answers "is this
//! provider currently eligible". It never decides routing itself; the
//! retry executor or a higher-level selection policy reacts to an open
//! circuit (e.g. by skipping to a fallback provider).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::Display;
use tokio::time::Instant;

/// Circuit state for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Calls blocked until the recovery window elapses.
    Open,
    /// One probe call allowed; its outcome decides the next state.
    HalfOpen,
}

/// Mutable health record for one provider.
#[derive(Debug, Clone)]
struct ProviderHealth {
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    circuit: CircuitState,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            circuit: CircuitState::Closed,
            last_failure: None,
            last_success: None,
            opened_at: None,
        }
    }

    /// Lazily move open -> half-open once the recovery window has elapsed.
    /// Evaluated on reads, not on a timer.
    fn tick(&mut self, recovery_window: Duration) {
        if self.circuit == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= recovery_window {
                    self.circuit = CircuitState::HalfOpen;
                }
            }
        }
    }
}

/// Read-only view of a provider's health, for diagnostics and logging.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub circuit: CircuitState,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

/// Shared registry of provider health records, keyed by provider name.
///
/// Records are created lazily on first use and live for the process.
/// Updates are O(1) counter mutations under a single lock, which keeps
/// concurrent turns against the same provider safe.
#[derive(Debug)]
pub struct HealthRegistry {
    records: Mutex<HashMap<String, ProviderHealth>>,
    failure_threshold: u32,
    recovery_window: Duration,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

impl HealthRegistry {
    /// Create a registry with a consecutive-failure threshold and a
    /// recovery window for open circuits.
    pub fn new(failure_threshold: u32, recovery_window: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            failure_threshold,
            recovery_window,
        }
    }

    /// Whether the provider is currently eligible for a call.
    ///
    /// Unknown providers are implicitly available. An open circuit whose
    /// recovery window has elapsed transitions to half-open here.
    pub fn is_available(&self, provider: &str) -> bool {
        let mut records = self.records.lock().expect("health lock poisoned");
        match records.get_mut(provider) {
            None => true,
            Some(record) => {
                record.tick(self.recovery_window);
                record.circuit != CircuitState::Open
            }
        }
    }

    /// Record a successful call. Always resets the consecutive-failure
    /// counter; closes a half-open circuit.
    pub fn record_success(&self, provider: &str) {
        let mut records = self.records.lock().expect("health lock poisoned");
        let record = records
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new);
        record.consecutive_failures = 0;
        record.total_successes += 1;
        record.last_success = Some(Utc::now());
        if record.circuit != CircuitState::Closed {
            tracing::debug!(provider, "circuit closed after successful probe");
            record.circuit = CircuitState::Closed;
            record.opened_at = None;
        }
    }

    /// Record a failed call. Opens the circuit when consecutive failures
    /// reach the threshold; a half-open probe failure re-opens immediately.
    pub fn record_failure(&self, provider: &str) {
        let mut records = self.records.lock().expect("health lock poisoned");
        let record = records
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new);
        record.consecutive_failures += 1;
        record.total_failures += 1;
        record.last_failure = Some(Utc::now());

        let reopen = record.circuit == CircuitState::HalfOpen;
        if reopen || record.consecutive_failures >= self.failure_threshold {
            if record.circuit != CircuitState::Open {
                tracing::warn!(
                    provider,
                    consecutive_failures = record.consecutive_failures,
                    "circuit opened"
                );
            }
            record.circuit = CircuitState::Open;
            record.opened_at = Some(Instant::now());
        }
    }

    /// Snapshot a provider's health, applying the lazy open -> half-open
    /// transition first. Returns `None` for providers never seen.
    pub fn snapshot(&self, provider: &str) -> Option<HealthSnapshot> {
        let mut records = self.records.lock().expect("health lock poisoned");
        let record = records.get_mut(provider)?;
        record.tick(self.recovery_window);
        Some(HealthSnapshot {
            consecutive_failures: record.consecutive_failures,
            total_failures: record.total_failures,
            total_successes: record.total_successes,
            circuit: record.circuit,
            last_failure: record.last_failure,
            last_success: record.last_success,
        })
    }
}
