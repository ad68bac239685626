//! Adaptive concurrency controller: windowed signal aggregation that mutates
//! semaphore limits (spec §4.5).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::concurrency::ConcurrencyGates;
use crate::config::AdaptiveConcurrencyConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct Observation {
    pub latency_ms: u64,
    pub timeout: bool,
    pub challenge: bool,
    pub http_4xx: bool,
    pub http_5xx: bool,
    pub queue_pressure: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitSnapshot {
    pub limit: usize,
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdaptiveSnapshot {
    pub enabled: bool,
    pub global: LimitSnapshot,
    pub scoped: LimitSnapshot,
}

struct TrackState {
    samples: VecDeque<Observation>,
    last_adjusted: Option<Instant>,
}

impl TrackState {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            last_adjusted: None,
        }
    }
}

/// Per-track (global + per-scope) sliding-window adaptive limiter (spec §4.5).
pub struct AdaptiveController {
    config: AdaptiveConcurrencyConfig,
    global_limit: Mutex<usize>,
    scope_limits: DashMap<String, usize>,
    global_track: Mutex<TrackState>,
    scope_tracks: DashMap<String, Mutex<TrackState>>,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConcurrencyConfig) -> Self {
        let initial_global = config.max_global;
        Self {
            global_limit: Mutex::new(initial_global),
            scope_limits: DashMap::new(),
            global_track: Mutex::new(TrackState::new()),
            scope_tracks: DashMap::new(),
            config,
        }
    }

    fn min_limit(&self) -> usize {
        self.config.min_limit.max(1)
    }

    fn scope_limit(&self, scope: &str) -> usize {
        *self
            .scope_limits
            .entry(scope.to_string())
            .or_insert(self.config.max_per_domain)
    }

    /// Appends an observation for `scope` and, if the per-track cooldown has
    /// elapsed, recomputes that track's limit (spec §4.5).
    pub fn observe_global(&self, observation: Observation) {
        if !self.config.enabled {
            return;
        }
        let mut track = self.global_track.lock();
        let mut limit = self.global_limit.lock();
        self.observe_track(&mut track, &mut limit, observation, self.config.max_global);
    }

    pub fn observe_scope(&self, scope: &str, observation: Observation) {
        if !self.config.enabled {
            return;
        }
        let default_limit = self.scope_limit(scope);
        let track_entry = self
            .scope_tracks
            .entry(scope.to_string())
            .or_insert_with(|| Mutex::new(TrackState::new()));
        let mut track = track_entry.lock();
        let mut limit_entry = self.scope_limits.entry(scope.to_string()).or_insert(default_limit);
        self.observe_track(&mut track, &mut limit_entry, observation, self.config.max_global.max(default_limit));
    }

    fn observe_track(&self, track: &mut TrackState, limit: &mut usize, observation: Observation, max: usize) {
        let window = self.config.window_size_clamped();
        track.samples.push_back(observation);
        while track.samples.len() > window {
            track.samples.pop_front();
        }

        let cooldown = self.config.cooldown_clamped();
        let now = Instant::now();
        let ready = match track.last_adjusted {
            Some(last) => now.duration_since(last) >= cooldown,
            None => true,
        };
        if !ready {
            return;
        }

        let metrics = WindowMetrics::compute(&track.samples);
        let min = self.min_limit();
        let new_limit = if metrics.is_unhealthy(self.config.healthy_latency_ms) {
            let decreased = (*limit as f64 * self.config.decrease_factor_clamped()).floor() as i64;
            decreased.max(0) as usize
        } else if metrics.is_healthy(self.config.healthy_latency_ms) {
            limit.saturating_add(self.config.increase_step_clamped())
        } else {
            *limit
        };
        let clamped = new_limit.clamp(min, max.max(min));
        if clamped != *limit {
            *limit = clamped;
            track.last_adjusted = Some(now);
            tracing::debug!(new_limit = clamped, "adaptive_limit_adjusted");
        } else {
            track.last_adjusted = Some(now);
        }
    }

    pub fn snapshot(&self, scope: &str) -> AdaptiveSnapshot {
        let global_limit = *self.global_limit.lock();
        let scoped_limit = self.scope_limit(scope);
        AdaptiveSnapshot {
            enabled: self.config.enabled,
            global: LimitSnapshot {
                limit: global_limit,
                min: self.min_limit(),
                max: self.config.max_global,
            },
            scoped: LimitSnapshot {
                limit: scoped_limit,
                min: self.min_limit(),
                max: self.config.max_per_domain.max(self.min_limit()),
            },
        }
    }

    /// Syncs semaphore limits from the current snapshot before admission
    /// (spec §4.7 step 2/4b).
    pub fn sync_gates(&self, gates: &ConcurrencyGates, scope: &str) {
        let snapshot = self.snapshot(scope);
        gates.global().set_limit(snapshot.global.limit);
        gates.scope(scope).set_limit(snapshot.scoped.limit);
    }

    /// Clamps a caller-supplied `max_per_domain` / `fetch_concurrency` value
    /// to the current scoped limit for web crawl operations (spec §4.5,
    /// last paragraph).
    pub fn clamp_to_scope(&self, scope: &str, requested: usize) -> usize {
        requested.min(self.scope_limit(scope))
    }
}

struct WindowMetrics {
    p95_latency_ms: u64,
    timeout_rate: f64,
    challenge_rate: f64,
    rate_5xx: f64,
    rate_4xx: f64,
    avg_queue_pressure: f64,
}

impl WindowMetrics {
    fn compute(samples: &VecDeque<Observation>) -> Self {
        let n = samples.len().max(1);
        let mut latencies: Vec<u64> = samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();
        let p95_index = ((n as f64) * 0.95).ceil() as usize;
        let p95_index = p95_index.saturating_sub(1).min(n.saturating_sub(1));
        let p95_latency_ms = latencies.get(p95_index).copied().unwrap_or(0);

        let timeout_rate = samples.iter().filter(|s| s.timeout).count() as f64 / n as f64;
        let challenge_rate = samples.iter().filter(|s| s.challenge).count() as f64 / n as f64;
        let rate_5xx = samples.iter().filter(|s| s.http_5xx).count() as f64 / n as f64;
        let rate_4xx = samples.iter().filter(|s| s.http_4xx).count() as f64 / n as f64;
        let avg_queue_pressure = samples.iter().map(|s| s.queue_pressure).sum::<f64>() / n as f64;

        Self {
            p95_latency_ms,
            timeout_rate,
            challenge_rate,
            rate_5xx,
            rate_4xx,
            avg_queue_pressure,
        }
    }

    fn is_unhealthy(&self, healthy_latency_ms: u64) -> bool {
        self.timeout_rate > 0.0
            || self.challenge_rate > 0.0
            || self.rate_5xx > 0.15
            || self.rate_4xx > 0.3
            || (self.p95_latency_ms as f64) > (healthy_latency_ms as f64) * 1.35
            || self.avg_queue_pressure > 0.85
    }

    fn is_healthy(&self, healthy_latency_ms: u64) -> bool {
        self.timeout_rate == 0.0
            && self.challenge_rate == 0.0
            && self.rate_5xx == 0.0
            && (self.p95_latency_ms as f64) <= healthy_latency_ms as f64
            && self.avg_queue_pressure < 0.6
    }
}
