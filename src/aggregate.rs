//! Aggregator: sequential and fan-out strategies over selected providers,
//! with Tier-A fallback (spec §4.8).

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::adapter::{CookiePolicy, OperationInput, ProviderAdapter};
use crate::blocker::BlockerSignal;
use crate::error::ProviderError;
use crate::pipeline::{self, Diagnostics, ExecutionMetadata, PipelineDeps};
use crate::record::{NormalizedRecord, Source};
use crate::selector::{select_providers, SelectionMode};
use crate::tier::{fallback_tier_metadata, should_fallback_to_tier_a, TierMetadata};
use crate::trace::TraceContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub provider: String,
    pub error: ProviderError,
    pub latency_ms: u64,
    pub attempts: u32,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct AggregateResult {
    pub ok: bool,
    pub records: Vec<NormalizedRecord>,
    pub trace: TraceContext,
    pub partial: bool,
    pub failures: Vec<FailureEntry>,
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub retries: u32,
    pub latency_ms: u64,
    pub provider_order: Vec<String>,
    pub execution_metadata: Option<ExecutionMetadata>,
    pub diagnostics: Option<Diagnostics>,
    pub blocker: Option<BlockerSignal>,
    pub error: Option<ProviderError>,
}

/// Per-execute() call options threaded down into every pipeline invocation.
pub struct ExecuteOptions<'a> {
    pub mode: &'a SelectionMode,
    pub allow_list: Option<&'a [String]>,
    pub timeout_override: Option<Duration>,
    pub use_cookies: bool,
    pub cookie_policy_override: Option<CookiePolicy>,
    pub cancellation: CancellationToken,
}

struct AttemptOutcome {
    provider_id: String,
    result: pipeline::PipelineOutcome,
}

async fn attempt_one(
    adapter: Arc<dyn ProviderAdapter>,
    op: crate::config::Operation,
    input: OperationInput,
    trace: TraceContext,
    tier: TierMetadata,
    deps: &PipelineDeps<'_>,
    options: &ExecuteOptions<'_>,
) -> AttemptOutcome {
    let provider_id = adapter.id().to_string();
    let result = pipeline::invoke(
        &adapter,
        op,
        input,
        trace,
        tier,
        deps,
        options.timeout_override,
        options.use_cookies,
        options.cookie_policy_override,
        options.cancellation.clone(),
    )
    .await;
    AttemptOutcome { provider_id, result }
}

fn fallback_candidates(
    deps: &PipelineDeps<'_>,
    op: crate::config::Operation,
    allow_list: Option<&[String]>,
    already_attempted: &[String],
) -> Vec<Arc<dyn ProviderAdapter>> {
    select_providers(deps.registry, op, &SelectionMode::Source(Source::Web), allow_list)
        .into_iter()
        .filter(|a| !already_attempted.iter().any(|id| id == a.id()))
        .collect()
}

#[derive(Default)]
struct Accumulator {
    failures: Vec<FailureEntry>,
    provider_order: Vec<String>,
    attempted: u32,
    succeeded: u32,
    failed: u32,
    retries: u32,
    last_blocker: Option<BlockerSignal>,
    last_error: Option<ProviderError>,
    last_diagnostics: Option<Diagnostics>,
}

impl Accumulator {
    fn record_attempt(&mut self, outcome: AttemptOutcome) -> Option<(Vec<NormalizedRecord>, ExecutionMetadata, Diagnostics)> {
        self.attempted += 1;
        self.provider_order.push(outcome.provider_id.clone());
        match outcome.result {
            Ok(success) => {
                self.succeeded += 1;
                self.retries += success.retries;
                self.last_diagnostics = Some(success.diagnostics.clone());
                Some((success.records, success.execution_metadata, success.diagnostics))
            }
            Err(failure) => {
                self.failed += 1;
                self.retries += failure.retries;
                if failure.blocker.is_some() {
                    self.last_blocker = failure.blocker.clone();
                }
                self.last_diagnostics = Some(failure.diagnostics.clone());
                self.last_error = Some(failure.error.clone());
                self.failures.push(FailureEntry {
                    provider: outcome.provider_id,
                    error: failure.error,
                    latency_ms: failure.latency_ms,
                    attempts: failure.attempts,
                    retries: failure.retries,
                });
                None
            }
        }
    }
}

/// Sequential strategy (spec §4.8 "Sequential").
#[allow(clippy::too_many_arguments)]
async fn run_sequential(
    providers: Vec<Arc<dyn ProviderAdapter>>,
    op: crate::config::Operation,
    input: &OperationInput,
    trace: &TraceContext,
    tier: TierMetadata,
    deps: &PipelineDeps<'_>,
    options: &ExecuteOptions<'_>,
) -> (Accumulator, Option<(Vec<NormalizedRecord>, ExecutionMetadata, Diagnostics)>) {
    let mut acc = Accumulator::default();
    for provider in &providers {
        let outcome = attempt_one(provider.clone(), op, input.clone(), trace.clone(), tier, deps, options).await;
        if let Some(success) = acc.record_attempt(outcome) {
            return (acc, Some(success));
        }
    }

    if should_fallback_to_tier_a(tier.selected) {
        let attempted_ids: Vec<String> = acc.provider_order.clone();
        let fallback_providers = fallback_candidates(deps, op, options.allow_list, &attempted_ids);
        let fallback_tier = fallback_tier_metadata();
        for provider in &fallback_providers {
            let outcome = attempt_one(provider.clone(), op, input.clone(), trace.clone(), fallback_tier, deps, options).await;
            if let Some(success) = acc.record_attempt(outcome) {
                return (acc, Some(success));
            }
        }
    }

    (acc, None)
}

/// Fan-out strategy (spec §4.8 "Fan-out").
#[allow(clippy::too_many_arguments)]
async fn run_fan_out(
    providers: Vec<Arc<dyn ProviderAdapter>>,
    op: crate::config::Operation,
    input: &OperationInput,
    trace: &TraceContext,
    tier: TierMetadata,
    deps: &PipelineDeps<'_>,
    options: &ExecuteOptions<'_>,
) -> (Accumulator, Vec<NormalizedRecord>, Option<ExecutionMetadata>) {
    let mut acc = Accumulator::default();
    let mut records = Vec::new();
    let mut execution_metadata = None;

    let mut futures: FuturesUnordered<_> = providers
        .iter()
        .map(|provider| attempt_one(provider.clone(), op, input.clone(), trace.clone(), tier, deps, options))
        .collect();
    while let Some(outcome) = futures.next().await {
        if let Some((mut recs, meta, _diag)) = acc.record_attempt(outcome) {
            records.append(&mut recs);
            execution_metadata = Some(meta);
        }
    }

    if records.is_empty() && should_fallback_to_tier_a(tier.selected) {
        let fallback_providers = fallback_candidates(deps, op, options.allow_list, &acc.provider_order);
        let fallback_tier = fallback_tier_metadata();
        let mut futures: FuturesUnordered<_> = fallback_providers
            .iter()
            .map(|provider| attempt_one(provider.clone(), op, input.clone(), trace.clone(), fallback_tier, deps, options))
            .collect();
        while let Some(outcome) = futures.next().await {
            if let Some((mut recs, meta, _diag)) = acc.record_attempt(outcome) {
                records.append(&mut recs);
                execution_metadata = Some(meta);
            }
        }
    }

    (acc, records, execution_metadata)
}

/// Top-level entry point: selects providers, runs the chosen strategy, and
/// assembles the aggregate envelope (spec §4.8, §6 `execute`).
pub async fn execute(
    op: crate::config::Operation,
    input: OperationInput,
    trace: TraceContext,
    tier: TierMetadata,
    deps: &PipelineDeps<'_>,
    options: ExecuteOptions<'_>,
) -> AggregateResult {
    let started = Instant::now();
    let providers = select_providers(deps.registry, op, options.mode, options.allow_list);

    let (mut acc, records, execution_metadata, diagnostics) = match options.mode {
        SelectionMode::All => {
            let (acc, records, meta) = run_fan_out(providers, op, &input, &trace, tier, deps, &options).await;
            let diagnostics = acc.last_diagnostics.clone();
            (acc, records, meta, diagnostics)
        }
        _ => {
            let (acc, success) = run_sequential(providers, op, &input, &trace, tier, deps, &options).await;
            match success {
                Some((records, meta, diag)) => {
                    let diagnostics = Some(diag);
                    (acc, records, Some(meta), diagnostics)
                }
                None => {
                    let diagnostics = acc.last_diagnostics.clone();
                    (acc, Vec::new(), None, diagnostics)
                }
            }
        }
    };

    let ok = !records.is_empty();
    let partial = ok && !acc.failures.is_empty();
    let error = if ok { None } else { acc.last_error.take() };
    let blocker = acc.last_blocker.take();

    AggregateResult {
        ok,
        records,
        trace,
        partial,
        failures: std::mem::take(&mut acc.failures),
        attempted: acc.attempted,
        succeeded: acc.succeeded,
        failed: acc.failed,
        retries: acc.retries,
        latency_ms: started.elapsed().as_millis() as u64,
        provider_order: acc.provider_order,
        execution_metadata,
        diagnostics,
        blocker,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SearchInput;
    use crate::adaptive::AdaptiveController;
    use crate::antibot::AntiBotPolicy;
    use crate::config::{CircuitBreakerConfig, Operation, RuntimeConfig};
    use crate::error::ErrorCode;
    use crate::registry::Registry;
    use crate::testing::MockAdapter;
    use crate::concurrency::ConcurrencyGates;
    use crate::tier::{Tier, TierReasonCode};

    fn search_input() -> OperationInput {
        OperationInput::Search(SearchInput {
            query: "hello".into(),
            limit: None,
            filters: None,
        })
    }

    fn options(mode: &SelectionMode) -> ExecuteOptions<'_> {
        ExecuteOptions {
            mode,
            allow_list: None,
            timeout_override: None,
            use_cookies: false,
            cookie_policy_override: None,
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn sequential_success_on_first_provider() {
        let config = RuntimeConfig::default();
        let registry = Registry::new();
        registry.register(Arc::new(
            MockAdapter::new("web/a")
                .with_source(Source::Web)
                .with_ops(&[Operation::Search])
                .returning_records(Operation::Search, &["one"]),
        ));
        registry.register(Arc::new(
            MockAdapter::new("web/b")
                .with_source(Source::Web)
                .with_ops(&[Operation::Search])
                .returning_records(Operation::Search, &["two"]),
        ));
        let gates = ConcurrencyGates::new(16, 4);
        let adaptive = AdaptiveController::new(config.adaptive_concurrency.clone());
        let antibot = AntiBotPolicy::new(config.anti_bot_policy.clone());
        let deps = PipelineDeps {
            registry: &registry,
            gates: &gates,
            adaptive: &adaptive,
            antibot: &antibot,
            config: &config,
            browser_fallback: None,
        };

        let mode = SelectionMode::Auto;
        let result = execute(
            Operation::Search,
            search_input(),
            TraceContext::new(),
            TierMetadata::new(Tier::A, TierReasonCode::DefaultTier),
            &deps,
            options(&mode),
        )
        .await;

        assert!(result.ok);
        assert_eq!(result.provider_order, vec!["web/a".to_string()]);
        assert!(result.failures.is_empty());
        assert!(!result.partial);
    }

    #[tokio::test]
    async fn sequential_fallback_to_next_provider_on_failure() {
        let mut config = RuntimeConfig::default();
        config.budgets.retries.read = 0;
        let registry = Registry::new();
        registry.register(Arc::new(
            MockAdapter::new("web/a")
                .with_source(Source::Web)
                .with_ops(&[Operation::Search])
                .returning_error(Operation::Search, ProviderError::new(ErrorCode::Upstream, "boom").with_retryable(true)),
        ));
        registry.register(Arc::new(
            MockAdapter::new("web/b")
                .with_source(Source::Web)
                .with_ops(&[Operation::Search])
                .returning_records(Operation::Search, &["two"]),
        ));
        let gates = ConcurrencyGates::new(16, 4);
        let adaptive = AdaptiveController::new(config.adaptive_concurrency.clone());
        let antibot = AntiBotPolicy::new(config.anti_bot_policy.clone());
        let deps = PipelineDeps {
            registry: &registry,
            gates: &gates,
            adaptive: &adaptive,
            antibot: &antibot,
            config: &config,
            browser_fallback: None,
        };

        let mode = SelectionMode::Auto;
        let result = execute(
            Operation::Search,
            search_input(),
            TraceContext::new(),
            TierMetadata::new(Tier::A, TierReasonCode::DefaultTier),
            &deps,
            options(&mode),
        )
        .await;

        assert!(result.ok);
        assert!(result.partial);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.provider_order, vec!["web/a".to_string(), "web/b".to_string()]);
    }

    #[tokio::test]
    async fn tier_a_fallback_engages_when_non_a_tier_exhausts() {
        let mut config = RuntimeConfig::default();
        config.budgets.retries.read = 0;
        let registry = Registry::new();
        registry.register(Arc::new(
            MockAdapter::new("community/a")
                .with_source(Source::Community)
                .with_ops(&[Operation::Search])
                .returning_error(Operation::Search, ProviderError::new(ErrorCode::Network, "down").with_retryable(true)),
        ));
        registry.register(Arc::new(
            MockAdapter::new("web/a")
                .with_source(Source::Web)
                .with_ops(&[Operation::Search])
                .returning_records(Operation::Search, &["fallback"]),
        ));
        let gates = ConcurrencyGates::new(16, 4);
        let adaptive = AdaptiveController::new(config.adaptive_concurrency.clone());
        let antibot = AntiBotPolicy::new(config.anti_bot_policy.clone());
        let deps = PipelineDeps {
            registry: &registry,
            gates: &gates,
            adaptive: &adaptive,
            antibot: &antibot,
            config: &config,
            browser_fallback: None,
        };

        let mode = SelectionMode::Source(Source::Community);
        let result = execute(
            Operation::Search,
            search_input(),
            TraceContext::new(),
            TierMetadata::new(Tier::B, TierReasonCode::DefaultTier),
            &deps,
            options(&mode),
        )
        .await;

        assert!(result.ok);
        assert_eq!(result.provider_order, vec!["community/a".to_string(), "web/a".to_string()]);
    }

    #[tokio::test]
    async fn fan_out_merges_all_successes() {
        let config = RuntimeConfig::default();
        let registry = Registry::new();
        registry.register(Arc::new(
            MockAdapter::new("web/a")
                .with_source(Source::Web)
                .with_ops(&[Operation::Search])
                .returning_records(Operation::Search, &["one"]),
        ));
        registry.register(Arc::new(
            MockAdapter::new("web/b")
                .with_source(Source::Web)
                .with_ops(&[Operation::Search])
                .returning_records(Operation::Search, &["two"]),
        ));
        let gates = ConcurrencyGates::new(16, 4);
        let adaptive = AdaptiveController::new(config.adaptive_concurrency.clone());
        let antibot = AntiBotPolicy::new(config.anti_bot_policy.clone());
        let deps = PipelineDeps {
            registry: &registry,
            gates: &gates,
            adaptive: &adaptive,
            antibot: &antibot,
            config: &config,
            browser_fallback: None,
        };

        let mode = SelectionMode::All;
        let result = execute(
            Operation::Search,
            search_input(),
            TraceContext::new(),
            TierMetadata::new(Tier::A, TierReasonCode::DefaultTier),
            &deps,
            options(&mode),
        )
        .await;

        assert!(result.ok);
        assert_eq!(result.records.len(), 2);
        assert!(!result.partial);
    }

    #[tokio::test]
    async fn total_failure_sets_top_level_error() {
        let mut config = RuntimeConfig::default();
        config.budgets.retries.read = 0;
        config.budgets.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 100,
            cooldown_ms: 60_000,
        };
        let registry = Registry::new();
        registry.register(Arc::new(
            MockAdapter::new("web/a")
                .with_source(Source::Web)
                .with_ops(&[Operation::Search])
                .returning_error(Operation::Search, ProviderError::new(ErrorCode::Upstream, "boom").with_retryable(true)),
        ));
        let gates = ConcurrencyGates::new(16, 4);
        let adaptive = AdaptiveController::new(config.adaptive_concurrency.clone());
        let antibot = AntiBotPolicy::new(config.anti_bot_policy.clone());
        let deps = PipelineDeps {
            registry: &registry,
            gates: &gates,
            adaptive: &adaptive,
            antibot: &antibot,
            config: &config,
            browser_fallback: None,
        };

        let mode = SelectionMode::Source(Source::Web);
        let result = execute(
            Operation::Search,
            search_input(),
            TraceContext::new(),
            TierMetadata::new(Tier::A, TierReasonCode::DefaultTier),
            &deps,
            options(&mode),
        )
        .await;

        assert!(!result.ok);
        assert!(result.error.is_some());
        assert!(!result.partial);
    }
}
