//! Provider adapter contract (spec §3 "Provider adapter", §6 "Provider
//! adapter contract", §9 "Adapter polymorphism").

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::Operation;
use crate::error::ProviderError;
use crate::record::{NormalizedRecord, Source};
use crate::trace::TraceContext;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchInput {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchInput {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStrategy {
    Bfs,
    Dfs,
}

impl Default for CrawlStrategy {
    fn default() -> Self {
        CrawlStrategy::Bfs
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlInput {
    pub seed_urls: Vec<String>,
    #[serde(default)]
    pub strategy: CrawlStrategy,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_pages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_per_domain: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostInput {
    pub target: String,
    pub content: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub risk_accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<serde_json::Value>,
}

/// Typed, per-operation caller input (spec §6 `execute` overloads).
#[derive(Debug, Clone)]
pub enum OperationInput {
    Search(SearchInput),
    Fetch(FetchInput),
    Crawl(CrawlInput),
    Post(PostInput),
}

impl OperationInput {
    pub fn operation(&self) -> Operation {
        match self {
            OperationInput::Search(_) => Operation::Search,
            OperationInput::Fetch(_) => Operation::Fetch,
            OperationInput::Crawl(_) => Operation::Crawl,
            OperationInput::Post(_) => Operation::Post,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CookiePolicy {
    Off,
    Auto,
    Required,
}

/// Request to escalate a stuck attempt into a browser-assisted fallback
/// (spec §6 "Browser fallback port").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserFallbackRequest {
    pub provider: String,
    pub source: Source,
    pub operation: Operation,
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub preferred_modes: Vec<String>,
    #[serde(default)]
    pub use_cookies: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cookie_policy_override: Option<CookiePolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserFallbackOutput {
    pub ok: bool,
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<serde_json::Value>,
}

#[async_trait]
pub trait BrowserFallbackPort: Send + Sync {
    async fn resolve(&self, request: BrowserFallbackRequest) -> BrowserFallbackOutput;
}

/// Per-attempt context handed to adapters (spec §6 "Provider adapter contract").
#[derive(Clone)]
pub struct InvocationContext {
    pub trace: TraceContext,
    pub timeout: std::time::Duration,
    pub attempt: u32,
    pub cancellation: CancellationToken,
    pub use_cookies: bool,
    pub cookie_policy_override: Option<CookiePolicy>,
    pub browser_fallback_port: Option<Arc<dyn BrowserFallbackPort>>,
}

/// Capability metadata an adapter declares for a single operation
/// (spec §3 "per-operation capability metadata").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationCapability {
    pub supported: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub id: String,
    pub source: Source,
    pub search: OperationCapability,
    pub fetch: OperationCapability,
    pub crawl: OperationCapability,
    pub post: OperationCapability,
}

/// A pluggable provider-specific unit (spec §3 "Provider adapter", §9
/// "Adapter polymorphism" — modeled here as trait methods with default
/// `not_supported` bodies rather than `Option<fn>` fields, since async trait
/// methods compose more naturally with `dyn ProviderAdapter`).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &str;
    fn source(&self) -> Source;
    fn capabilities(&self) -> Capabilities;

    async fn search(&self, _input: SearchInput, ctx: &InvocationContext) -> Result<Vec<NormalizedRecord>, ProviderError> {
        let _ = ctx;
        Err(ProviderError::not_supported(self.id(), "search"))
    }

    async fn fetch(&self, _input: FetchInput, ctx: &InvocationContext) -> Result<Vec<NormalizedRecord>, ProviderError> {
        let _ = ctx;
        Err(ProviderError::not_supported(self.id(), "fetch"))
    }

    async fn crawl(&self, _input: CrawlInput, ctx: &InvocationContext) -> Result<Vec<NormalizedRecord>, ProviderError> {
        let _ = ctx;
        Err(ProviderError::not_supported(self.id(), "crawl"))
    }

    async fn post(&self, _input: PostInput, ctx: &InvocationContext) -> Result<Vec<NormalizedRecord>, ProviderError> {
        let _ = ctx;
        Err(ProviderError::not_supported(self.id(), "post"))
    }

    /// Optional health probe (spec §10.6 "Health probes"); `None` means the
    /// adapter doesn't support being probed.
    async fn health_probe(&self) -> Option<Result<u64, ProviderError>> {
        None
    }

    /// Dispatches whichever operation `input` names. Adapters normally only
    /// override the specific `search`/`fetch`/`crawl`/`post` methods; the
    /// pipeline calls this single entry point.
    async fn dispatch(
        &self,
        input: OperationInput,
        ctx: &InvocationContext,
    ) -> Result<Vec<NormalizedRecord>, ProviderError> {
        match input {
            OperationInput::Search(i) => self.search(i, ctx).await,
            OperationInput::Fetch(i) => self.fetch(i, ctx).await,
            OperationInput::Crawl(i) => self.crawl(i, ctx).await,
            OperationInput::Post(i) => self.post(i, ctx).await,
        }
    }
}
