//! Provider registry: adapters, health, and circuit-breaker state (spec §4.1).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::adapter::{Capabilities, ProviderAdapter};
use crate::config::CircuitBreakerConfig;
use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latency_sample_ms: Option<u64>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            updated_at: chrono::Utc::now(),
            latency_sample_ms: None,
        }
    }
}

/// Per-provider circuit-breaker state machine (spec §4.1).
///
/// `closed` (default) counts consecutive failures; at `failure_threshold` it
/// latches `open` with a cooldown expiry and the triggering error. `open`
/// implicitly resets to `closed` on the next `mark_success` or on the next
/// admission attempt once the cooldown has elapsed.
#[derive(Debug, Clone)]
struct CircuitEntry {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    last_error: Option<ProviderError>,
}

impl Default for CircuitEntry {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            cooldown_until: None,
            last_error: None,
        }
    }
}

impl CircuitEntry {
    fn is_open(&self, now: Instant) -> bool {
        match self.cooldown_until {
            Some(until) => now < until,
            None => false,
        }
    }
}

struct ProviderEntry {
    adapter: Arc<dyn ProviderAdapter>,
    health: parking_lot::RwLock<ProviderHealth>,
    circuit: parking_lot::Mutex<CircuitEntry>,
}

/// Holds the set of registered adapters keyed by id (spec §4.1, §4.9 ownership).
#[derive(Default)]
pub struct Registry {
    providers: DashMap<String, Arc<ProviderEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent replace-by-id (spec §4.1 "register").
    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        let id = adapter.id().to_string();
        self.providers.insert(
            id,
            Arc::new(ProviderEntry {
                adapter,
                health: parking_lot::RwLock::new(ProviderHealth::default()),
                circuit: parking_lot::Mutex::new(CircuitEntry::default()),
            }),
        );
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.providers.get(id).map(|entry| entry.adapter.clone())
    }

    pub fn list(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.providers.iter().map(|entry| entry.adapter.clone()).collect()
    }

    pub fn capabilities(&self) -> Vec<Capabilities> {
        self.providers.iter().map(|entry| entry.adapter.capabilities()).collect()
    }

    pub fn get_health(&self, id: &str) -> Option<ProviderHealth> {
        self.providers.get(id).map(|entry| entry.health.read().clone())
    }

    pub fn set_health(&self, id: &str, status: HealthStatus, latency_sample_ms: Option<u64>) {
        if let Some(entry) = self.providers.get(id) {
            let mut health = entry.health.write();
            health.status = status;
            health.updated_at = chrono::Utc::now();
            health.latency_sample_ms = latency_sample_ms;
        }
    }

    /// True iff the circuit is currently open; purges an expired cooldown as
    /// a side effect (spec §4.1 "open ... implicitly resets ... on the next
    /// admission attempt after the timestamp passes").
    pub fn is_circuit_open(&self, id: &str) -> bool {
        let Some(entry) = self.providers.get(id) else {
            return false;
        };
        let mut circuit = entry.circuit.lock();
        let now = Instant::now();
        if circuit.is_open(now) {
            true
        } else {
            if circuit.cooldown_until.is_some() {
                circuit.cooldown_until = None;
            }
            false
        }
    }

    pub fn get_circuit_error(&self, id: &str) -> Option<ProviderError> {
        self.providers.get(id).and_then(|entry| entry.circuit.lock().last_error.clone())
    }

    pub fn mark_success(&self, id: &str, latency_ms: u64) {
        if let Some(entry) = self.providers.get(id) {
            let mut circuit = entry.circuit.lock();
            circuit.consecutive_failures = 0;
            circuit.cooldown_until = None;
            drop(circuit);
            let mut health = entry.health.write();
            health.status = HealthStatus::Healthy;
            health.updated_at = chrono::Utc::now();
            health.latency_sample_ms = Some(latency_ms);
        }
    }

    pub fn mark_failure(&self, id: &str, error: ProviderError, breaker: &CircuitBreakerConfig) {
        if let Some(entry) = self.providers.get(id) {
            let mut circuit = entry.circuit.lock();
            circuit.consecutive_failures += 1;
            circuit.last_error = Some(error);
            if circuit.consecutive_failures >= breaker.failure_threshold {
                circuit.cooldown_until =
                    Some(Instant::now() + Duration::from_millis(breaker.cooldown_ms));
                tracing::warn!(
                    provider = id,
                    failures = circuit.consecutive_failures,
                    cooldown_ms = breaker.cooldown_ms,
                    "circuit_opened"
                );
            }
            drop(circuit);
            let mut health = entry.health.write();
            health.status = HealthStatus::Unhealthy;
            health.updated_at = chrono::Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAdapter;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_ms,
        }
    }

    #[test]
    fn register_is_idempotent_by_id() {
        let registry = Registry::new();
        registry.register(Arc::new(MockAdapter::new("web/a")));
        registry.register(Arc::new(MockAdapter::new("web/a")));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn circuit_opens_after_threshold_and_closes_after_cooldown() {
        let registry = Registry::new();
        registry.register(Arc::new(MockAdapter::new("web/a")));
        let breaker_cfg = breaker(2, 10);
        let error = ProviderError::new(crate::error::ErrorCode::Upstream, "boom");

        assert!(!registry.is_circuit_open("web/a"));
        registry.mark_failure("web/a", error.clone(), &breaker_cfg);
        assert!(!registry.is_circuit_open("web/a"));
        registry.mark_failure("web/a", error.clone(), &breaker_cfg);
        assert!(registry.is_circuit_open("web/a"));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!registry.is_circuit_open("web/a"));
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let registry = Registry::new();
        registry.register(Arc::new(MockAdapter::new("web/a")));
        let breaker_cfg = breaker(2, 10_000);
        let error = ProviderError::new(crate::error::ErrorCode::Upstream, "boom");

        registry.mark_failure("web/a", error.clone(), &breaker_cfg);
        registry.mark_success("web/a", 42);
        registry.mark_failure("web/a", error, &breaker_cfg);
        assert!(!registry.is_circuit_open("web/a"));
    }

    #[test]
    fn unregistered_provider_circuit_is_never_open() {
        let registry = Registry::new();
        assert!(!registry.is_circuit_open("web/missing"));
    }
}
