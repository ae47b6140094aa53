//! Circuit breaker for ingestion provider health tracking.
//!
//! Providers that keep failing are quarantined for a cool-down period, after
//! which they are offered one more chance in the degraded state.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Recent outcomes kept per provider.
const WINDOW: usize = 20;

/// State of a provider in the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Healthy,
    /// Failing, but still tried
    Degraded,
    /// Skipped until the cool-down elapses
    CoolingDown,
}

#[derive(Debug, Clone)]
struct ProviderHealth {
    state: ProviderState,
    consecutive_failures: u32,
    cooldown_start: Option<Instant>,
    recent: VecDeque<bool>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            state: ProviderState::Healthy,
            consecutive_failures: 0,
            cooldown_start: None,
            recent: VecDeque::with_capacity(WINDOW),
        }
    }

    fn push(&mut self, success: bool) {
        if self.recent.len() == WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
    }

    fn success_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        self.recent.iter().filter(|ok| **ok).count() as f64 / self.recent.len() as f64
    }
}

/// Health snapshot for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderHealthStats {
    pub state: ProviderState,
    pub consecutive_failures: u32,
    pub success_rate: f64,
}

/// Tracks provider health by name.
pub struct CircuitBreaker {
    providers: HashMap<String, ProviderHealth>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    #[instrument(skip(self))]
    pub fn record_success(&mut self, provider: &str) {
        let health = self.health_mut(provider);
        health.consecutive_failures = 0;
        health.push(true);
        if health.state != ProviderState::Healthy {
            health.state = ProviderState::Healthy;
            health.cooldown_start = None;
            debug!("Provider {} recovered to healthy state", provider);
        }
    }

    #[instrument(skip(self))]
    pub fn record_failure(&mut self, provider: &str) {
        let threshold = self.failure_threshold;
        let health = self.health_mut(provider);
        health.consecutive_failures += 1;
        health.push(false);

        match health.state {
            ProviderState::Healthy if health.consecutive_failures >= threshold => {
                health.state = ProviderState::Degraded;
                debug!("Provider {} degraded: {} consecutive failures", provider, health.consecutive_failures);
            }
            ProviderState::Degraded if health.consecutive_failures >= threshold * 2 => {
                health.state = ProviderState::CoolingDown;
                health.cooldown_start = Some(Instant::now());
                warn!(
                    "Provider {} entering cooldown: {} failures, {:.0}% success rate",
                    provider,
                    health.consecutive_failures,
                    health.success_rate() * 100.0
                );
            }
            _ => {}
        }
    }

    /// Whether `provider` may be tried now. An expired cool-down moves the
    /// provider back to degraded.
    pub fn is_available(&mut self, provider: &str) -> bool {
        let cooldown = self.cooldown;
        let threshold = self.failure_threshold;
        let health = self.health_mut(provider);
        match (health.state, health.cooldown_start) {
            (ProviderState::CoolingDown, Some(started)) if started.elapsed() < cooldown => false,
            (ProviderState::CoolingDown, _) => {
                health.state = ProviderState::Degraded;
                health.cooldown_start = None;
                // One more failure sends it straight back to cool-down.
                health.consecutive_failures = threshold * 2 - 1;
                debug!("Provider {} cooldown expired, moving to degraded state", provider);
                true
            }
            _ => true,
        }
    }

    pub fn state(&self, provider: &str) -> ProviderState {
        self.providers
            .get(provider)
            .map(|h| h.state)
            .unwrap_or(ProviderState::Healthy)
    }

    pub fn stats(&self) -> HashMap<String, ProviderHealthStats> {
        self.providers
            .iter()
            .map(|(name, health)| {
                (
                    name.clone(),
                    ProviderHealthStats {
                        state: health.state,
                        consecutive_failures: health.consecutive_failures,
                        success_rate: health.success_rate(),
                    },
                )
            })
            .collect()
    }

    fn health_mut(&mut self, provider: &str) -> &mut ProviderHealth {
        self.providers
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new)
    }
}
