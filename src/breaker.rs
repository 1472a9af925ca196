use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::CircuitOpenError;

/// Failure-isolation state of one downstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,

    /// Time an open breaker waits before admitting a trial call.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    config: CircuitBreakerConfig,
}

impl Circuit {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            config,
        }
    }
}

/// Per-service circuit breakers, keyed by downstream name.
///
/// Transitions are driven exclusively by the retry orchestrator reporting
/// call outcomes; nothing else mutates breaker state. State lives
/// in-process — one registry per pipeline instance, injected rather than
/// ambient so tests get a fresh one each time.
pub struct CircuitBreakerRegistry {
    circuits: Mutex<HashMap<String, Circuit>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            default_config,
        }
    }

    /// Ask whether a call to `service` may proceed.
    ///
    /// Closed admits. Open denies until `recovery_timeout` has elapsed
    /// since the breaker tripped, at which point the breaker moves to
    /// half-open and admits exactly one trial call; concurrent callers
    /// during the trial are denied.
    pub async fn try_admit(&self, service: &str) -> Result<(), CircuitOpenError> {
        let mut guard = self.circuits.lock().await;
        let circuit = guard
            .entry(service.to_string())
            .or_insert_with(|| Circuit::new(self.default_config.clone()));

        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let recovered = circuit
                    .opened_at
                    .map(|at| at.elapsed() >= circuit.config.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        service: service.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    Err(CircuitOpenError {
                        service: service.to_string(),
                    })
                } else {
                    circuit.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Report a successful call.
    pub async fn record_success(&self, service: &str) {
        let mut guard = self.circuits.lock().await;
        let Some(circuit) = guard.get_mut(service) else {
            return;
        };

        circuit.consecutive_failures = 0;
        circuit.trial_in_flight = false;
        if circuit.state != CircuitState::Closed {
            circuit.state = CircuitState::Closed;
            circuit.opened_at = None;
        }
    }

    /// Report a failed call.
    pub async fn record_failure(&self, service: &str) {
        let mut guard = self.circuits.lock().await;
        let circuit = guard
            .entry(service.to_string())
            .or_insert_with(|| Circuit::new(self.default_config.clone()));

        match circuit.state {
            CircuitState::HalfOpen => {
                // Trial failed; re-open and restart the recovery clock.
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                circuit.trial_in_flight = false;
            }
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= circuit.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state of a service's breaker. Unknown services are closed.
    pub async fn state(&self, service: &str) -> CircuitState {
        let guard = self.circuits.lock().await;
        guard
            .get(service)
            .map(|circuit| circuit.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Override the config for one service, resetting its breaker.
    pub async fn set_config(&self, service: &str, config: CircuitBreakerConfig) {
        let mut guard = self.circuits.lock().await;
        guard.insert(service.to_string(), Circuit::new(config));
    }
}
