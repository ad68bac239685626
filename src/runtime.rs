//! Runtime: the composition root that owns the registry, concurrency gates,
//! adaptive controller, and anti-bot policy, and exposes the public
//! `execute`-style entry points (spec §6 "Config/runtime init", `execute`).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::adaptive::AdaptiveController;
use crate::adapter::{
    BrowserFallbackPort, CookiePolicy, CrawlInput, FetchInput, OperationInput, PostInput, ProviderAdapter, SearchInput,
};
use crate::aggregate::{execute as run_aggregate, AggregateResult, ExecuteOptions};
use crate::antibot::AntiBotPolicy;
use crate::concurrency::ConcurrencyGates;
use crate::config::{Operation, RuntimeConfig};
use crate::pipeline::PipelineDeps;
use crate::registry::Registry;
use crate::selector::SelectionMode;
use crate::tier::{self, TierSignals};
use crate::trace::TraceContext;

/// Per-call override knobs (spec §6 `options` parameter of `execute`).
#[derive(Default)]
pub struct CallOptions {
    pub source: Option<SelectionMode>,
    pub provider_ids: Option<Vec<String>>,
    pub timeout_ms: Option<u64>,
    pub trace: Option<TraceContext>,
    pub use_cookies: bool,
    pub cookie_policy_override: Option<CookiePolicy>,
    pub tier: Option<TierSignals>,
    pub cancellation: Option<CancellationToken>,
}

/// Composition root: one `Runtime` is built once per process and shared
/// across every `search`/`fetch`/`crawl`/`post` call (spec §4.1, §4.4, §4.5,
/// §4.6 own their respective pieces of state; this struct just holds them).
pub struct Runtime {
    registry: Registry,
    gates: ConcurrencyGates,
    adaptive: AdaptiveController,
    antibot: AntiBotPolicy,
    config: RuntimeConfig,
    browser_fallback: Option<Arc<dyn BrowserFallbackPort>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let gates = ConcurrencyGates::new(config.budgets.concurrency.global, config.budgets.concurrency.per_provider);
        let adaptive = AdaptiveController::new(config.adaptive_concurrency.clone());
        let antibot = AntiBotPolicy::new(config.anti_bot_policy.clone());
        Self {
            registry: Registry::new(),
            gates,
            adaptive,
            antibot,
            config,
            browser_fallback: None,
        }
    }

    pub fn with_browser_fallback(mut self, port: Arc<dyn BrowserFallbackPort>) -> Self {
        self.browser_fallback = Some(port);
        self
    }

    pub fn register_adapter(&self, adapter: Arc<dyn ProviderAdapter>) {
        self.registry.register(adapter);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn deps(&self) -> PipelineDeps<'_> {
        PipelineDeps {
            registry: &self.registry,
            gates: &self.gates,
            adaptive: &self.adaptive,
            antibot: &self.antibot,
            config: &self.config,
            browser_fallback: self.browser_fallback.as_ref(),
        }
    }

    /// Single entry point every typed overload below delegates to (spec §6
    /// `execute`).
    pub async fn execute(&self, op: Operation, input: OperationInput, options: CallOptions) -> AggregateResult {
        let trace = options.trace.unwrap_or_default();
        let signals = options.tier.unwrap_or_default();
        let tier = tier::select_tier(&self.config.tiers, &signals);
        let mode = options.source.unwrap_or_default();
        let timeout_override = options.timeout_ms.map(Duration::from_millis);
        let deps = self.deps();

        let exec_options = ExecuteOptions {
            mode: &mode,
            allow_list: options.provider_ids.as_deref(),
            timeout_override,
            use_cookies: options.use_cookies,
            cookie_policy_override: options.cookie_policy_override,
            cancellation: options.cancellation.unwrap_or_default(),
        };

        run_aggregate(op, input, trace, tier, &deps, exec_options).await
    }

    pub async fn search(&self, input: SearchInput, options: CallOptions) -> AggregateResult {
        self.execute(Operation::Search, OperationInput::Search(input), options).await
    }

    pub async fn fetch(&self, input: FetchInput, options: CallOptions) -> AggregateResult {
        self.execute(Operation::Fetch, OperationInput::Fetch(input), options).await
    }

    pub async fn crawl(&self, input: CrawlInput, options: CallOptions) -> AggregateResult {
        self.execute(Operation::Crawl, OperationInput::Crawl(input), options).await
    }

    pub async fn post(&self, input: PostInput, options: CallOptions) -> AggregateResult {
        self.execute(Operation::Post, OperationInput::Post(input), options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Operation;
    use crate::record::Source;
    use crate::testing::MockAdapter;

    #[tokio::test]
    async fn search_round_trips_through_a_registered_adapter() {
        let runtime = Runtime::new(RuntimeConfig::default());
        runtime.register_adapter(Arc::new(
            MockAdapter::new("web/a")
                .with_source(Source::Web)
                .with_ops(&[Operation::Search])
                .returning_records(Operation::Search, &["hello"]),
        ));

        let result = runtime
            .search(
                SearchInput {
                    query: "hello".into(),
                    limit: None,
                    filters: None,
                },
                CallOptions::default(),
            )
            .await;

        assert!(result.ok);
        assert_eq!(result.records.len(), 1);
    }

    #[tokio::test]
    async fn provider_ids_allow_list_restricts_selection() {
        let runtime = Runtime::new(RuntimeConfig::default());
        runtime.register_adapter(Arc::new(
            MockAdapter::new("web/a")
                .with_source(Source::Web)
                .with_ops(&[Operation::Search])
                .returning_records(Operation::Search, &["a"]),
        ));
        runtime.register_adapter(Arc::new(
            MockAdapter::new("web/b")
                .with_source(Source::Web)
                .with_ops(&[Operation::Search])
                .returning_records(Operation::Search, &["b"]),
        ));

        let result = runtime
            .search(
                SearchInput {
                    query: "hello".into(),
                    limit: None,
                    filters: None,
                },
                CallOptions {
                    provider_ids: Some(vec!["web/b".to_string()]),
                    ..Default::default()
                },
            )
            .await;

        assert!(result.ok);
        assert_eq!(result.provider_order, vec!["web/b".to_string()]);
    }
}
