//! Concurrency gate: global + per-scope admission with live-mutable limits
//! (spec §4.4).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use url::Url;

use crate::adapter::OperationInput;
use crate::config::Operation;

/// A counting semaphore whose limit can be raised or lowered live.
///
/// Raising wakes waiters immediately (`Semaphore::add_permits`). Lowering
/// never preempts in-flight work: it only takes effect as permits are
/// released, by shrinking `total_capacity` instead of returning the permit
/// to the pool (spec §4.4, §9 "Adaptive limit mutation without preemption").
pub struct ConcurrencyGate {
    semaphore: Semaphore,
    total_capacity: AtomicUsize,
    desired_limit: AtomicUsize,
    queued: AtomicUsize,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Semaphore::new(limit),
            total_capacity: AtomicUsize::new(limit),
            desired_limit: AtomicUsize::new(limit),
            queued: AtomicUsize::new(0),
        })
    }

    pub fn limit(&self) -> usize {
        self.desired_limit.load(Ordering::SeqCst)
    }

    pub fn set_limit(&self, new_limit: usize) {
        self.desired_limit.store(new_limit, Ordering::SeqCst);
        loop {
            let current = self.total_capacity.load(Ordering::SeqCst);
            if new_limit <= current {
                return; // shrink happens lazily as outstanding permits are released
            }
            if self
                .total_capacity
                .compare_exchange(current, new_limit, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.semaphore.add_permits(new_limit - current);
                return;
            }
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Best-effort `(active + queued) / limit` signal for the adaptive
    /// controller (spec §4.7 step 4f).
    pub fn pressure(&self) -> f64 {
        let limit = self.limit().max(1);
        let active = self
            .total_capacity
            .load(Ordering::SeqCst)
            .saturating_sub(self.available_permits());
        let queued = self.queued.load(Ordering::SeqCst);
        (active + queued) as f64 / limit as f64
    }

    pub async fn acquire(self: &Arc<Self>) -> GatePermit {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("gate semaphore is never closed");
        self.queued.fetch_sub(1, Ordering::SeqCst);
        permit.forget();
        GatePermit { gate: self.clone() }
    }

    fn release(&self) {
        loop {
            let current = self.total_capacity.load(Ordering::SeqCst);
            let desired = self.desired_limit.load(Ordering::SeqCst);
            if current > desired {
                if self
                    .total_capacity
                    .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return; // permanently shrink: do not return this permit
                }
            } else {
                self.semaphore.add_permits(1);
                return;
            }
        }
    }
}

/// RAII admission permit; dropping it releases (or, mid-shrink, retires)
/// capacity back to the gate.
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Global-then-scope admission (spec §4.4 "Admission is always global-then-scope").
pub struct AdmissionPermit {
    _global: GatePermit,
    _scope: GatePermit,
}

/// Owns the global semaphore plus a per-scope-key map of semaphores.
pub struct ConcurrencyGates {
    global: Arc<ConcurrencyGate>,
    scoped: DashMap<String, Arc<ConcurrencyGate>>,
    default_scope_limit: AtomicUsize,
}

impl ConcurrencyGates {
    pub fn new(global_limit: usize, default_scope_limit: usize) -> Self {
        Self {
            global: ConcurrencyGate::new(global_limit),
            scoped: DashMap::new(),
            default_scope_limit: AtomicUsize::new(default_scope_limit),
        }
    }

    pub fn global(&self) -> Arc<ConcurrencyGate> {
        self.global.clone()
    }

    pub fn scope(&self, scope_key: &str) -> Arc<ConcurrencyGate> {
        self.scoped
            .entry(scope_key.to_string())
            .or_insert_with(|| ConcurrencyGate::new(self.default_scope_limit.load(Ordering::SeqCst)))
            .clone()
    }

    pub async fn admit(&self, scope_key: &str) -> AdmissionPermit {
        let global_permit = self.global.acquire().await;
        let scope_permit = self.scope(scope_key).acquire().await;
        AdmissionPermit {
            _global: global_permit,
            _scope: scope_permit,
        }
    }
}

/// Scope-key derivation (spec §4.4). Invalid URLs fall back to the provider id.
pub fn derive_scope_key(op: Operation, input: &OperationInput, provider_id: &str) -> String {
    match (op, input) {
        (Operation::Fetch, OperationInput::Fetch(i)) => host_or_fallback(&i.url, provider_id),
        (Operation::Crawl, OperationInput::Crawl(i)) => i
            .seed_urls
            .first()
            .map(|u| host_or_fallback(u, provider_id))
            .unwrap_or_else(|| provider_id.to_string()),
        (Operation::Search, OperationInput::Search(i)) => host_or_fallback(&i.query, provider_id),
        _ => provider_id.to_string(),
    }
}

fn host_or_fallback(candidate: &str, provider_id: &str) -> String {
    Url::parse(candidate)
        .ok()
        .and_then(|url| url.host_str().map(|h| h.to_lowercase()))
        .unwrap_or_else(|| provider_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{FetchInput, SearchInput};

    #[test]
    fn fetch_scope_is_lowercased_host() {
        let input = OperationInput::Fetch(FetchInput {
            url: "https://Example.COM/path".into(),
            filters: None,
        });
        assert_eq!(derive_scope_key(Operation::Fetch, &input, "web/a"), "example.com");
    }

    #[test]
    fn fetch_scope_falls_back_to_provider_on_invalid_url() {
        let input = OperationInput::Fetch(FetchInput {
            url: "not a url".into(),
            filters: None,
        });
        assert_eq!(derive_scope_key(Operation::Fetch, &input, "web/a"), "web/a");
    }

    #[test]
    fn search_scope_falls_back_to_provider_for_plain_query() {
        let input = OperationInput::Search(SearchInput {
            query: "weather forecast".into(),
            limit: None,
            filters: None,
        });
        assert_eq!(derive_scope_key(Operation::Search, &input, "web/a"), "web/a");
    }

    #[test]
    fn post_scope_is_always_provider_id() {
        let input = OperationInput::Post(crate::adapter::PostInput {
            target: "t".into(),
            content: "c".into(),
            media_urls: vec![],
            confirm: true,
            risk_accepted: true,
            metadata: None,
        });
        assert_eq!(derive_scope_key(Operation::Post, &input, "social/a"), "social/a");
    }

    #[tokio::test]
    async fn raising_limit_admits_more_concurrently() {
        let gate = ConcurrencyGate::new(1);
        let first = gate.acquire().await;
        assert_eq!(gate.available_permits(), 0);
        gate.set_limit(2);
        let second = gate.acquire().await;
        assert_eq!(gate.available_permits(), 0);
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn lowering_limit_does_not_preempt_in_flight_permits() {
        let gate = ConcurrencyGate::new(2);
        let first = gate.acquire().await;
        let second = gate.acquire().await;
        gate.set_limit(1);
        // Both still hold their permits; nothing panics or is revoked.
        drop(first);
        // Capacity shrank by one on release; only one more admission fits.
        let third = gate.acquire().await;
        drop(second);
        drop(third);
        assert_eq!(gate.limit(), 1);
    }
}
