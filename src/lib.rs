//! Federated content-retrieval execution substrate.
//!
//! Wires tiered provider selection, concurrency admission, circuit
//! breaking, anti-bot cooldowns, prompt-injection guarding, and result
//! aggregation across `search`/`fetch`/`crawl`/`post` provider adapters.
//! [`runtime::Runtime`] is the composition root; register adapters with it
//! and call `search`/`fetch`/`crawl`/`post`.

pub mod adapter;
pub mod adaptive;
pub mod aggregate;
pub mod antibot;
pub mod blocker;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod prompt_guard;
pub mod realism;
pub mod record;
pub mod registry;
pub mod runtime;
pub mod selector;
pub mod tier;
pub mod trace;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use adapter::{
    BrowserFallbackOutput, BrowserFallbackPort, BrowserFallbackRequest, Capabilities, CookiePolicy, CrawlInput,
    FetchInput, InvocationContext, OperationCapability, OperationInput, PostInput, ProviderAdapter, SearchInput,
};
pub use aggregate::{AggregateResult, FailureEntry};
pub use blocker::BlockerSignal;
pub use config::{Operation, RuntimeConfig};
pub use error::{ErrorCode, ProviderError, ReasonCode};
pub use record::{NormalizedRecord, Source};
pub use runtime::{CallOptions, Runtime};
pub use selector::SelectionMode;
pub use tier::{Tier, TierSignals};
pub use trace::TraceContext;
