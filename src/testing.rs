//! In-memory adapter double used by this crate's own test suite
//! (spec §10.4 "Mock adapter").

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::adapter::{
    Capabilities, CrawlInput, FetchInput, InvocationContext, OperationCapability, PostInput, ProviderAdapter,
    SearchInput,
};
use crate::config::Operation;
use crate::error::ProviderError;
use crate::record::{NormalizedRecord, RecordBuilder, Source};

/// Scripted outcome for a single operation on a [`MockAdapter`].
enum Scripted {
    Ok(Vec<NormalizedRecord>),
    Err(ProviderError),
}

/// A `ProviderAdapter` double whose supported operations, records, and
/// failures are all configured by the test that builds it. Scripted outcomes
/// for a given operation are consumed in the order they were added; once the
/// queue is drained, calls return a single default record.
pub struct MockAdapter {
    id: String,
    source: Source,
    ops: Vec<Operation>,
    search_results: Mutex<VecDeque<Scripted>>,
    fetch_results: Mutex<VecDeque<Scripted>>,
    crawl_results: Mutex<VecDeque<Scripted>>,
    post_results: Mutex<VecDeque<Scripted>>,
    health_probe_ms: Mutex<Option<Result<u64, ProviderError>>>,
    calls: Mutex<Vec<Operation>>,
}

impl MockAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: Source::Web,
            ops: Vec::new(),
            search_results: Mutex::new(VecDeque::new()),
            fetch_results: Mutex::new(VecDeque::new()),
            crawl_results: Mutex::new(VecDeque::new()),
            post_results: Mutex::new(VecDeque::new()),
            health_probe_ms: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    pub fn with_ops(mut self, ops: &[Operation]) -> Self {
        self.ops = ops.to_vec();
        self
    }

    fn record(&self, content: &str) -> NormalizedRecord {
        RecordBuilder::new(self.id.clone(), self.source)
            .content(content)
            .build()
    }

    pub fn returning_records(self, op: Operation, contents: &[&str]) -> Self {
        let records = contents.iter().map(|c| self.record(c)).collect();
        self.push_result(op, Scripted::Ok(records))
    }

    pub fn returning_error(self, op: Operation, error: ProviderError) -> Self {
        self.push_result(op, Scripted::Err(error))
    }

    fn push_result(self, op: Operation, scripted: Scripted) -> Self {
        match op {
            Operation::Search => self.search_results.lock().push_back(scripted),
            Operation::Fetch => self.fetch_results.lock().push_back(scripted),
            Operation::Crawl => self.crawl_results.lock().push_back(scripted),
            Operation::Post => self.post_results.lock().push_back(scripted),
        }
        self
    }

    pub fn with_health_probe(self, result: Result<u64, ProviderError>) -> Self {
        *self.health_probe_ms.lock() = Some(result);
        self
    }

    pub fn call_count(&self, op: Operation) -> usize {
        self.calls.lock().iter().filter(|o| **o == op).count()
    }

    fn take(&self, op: Operation) -> Result<Vec<NormalizedRecord>, ProviderError> {
        self.calls.lock().push(op);
        let queue = match op {
            Operation::Search => &self.search_results,
            Operation::Fetch => &self.fetch_results,
            Operation::Crawl => &self.crawl_results,
            Operation::Post => &self.post_results,
        };
        match queue.lock().pop_front() {
            Some(Scripted::Ok(records)) => Ok(records),
            Some(Scripted::Err(error)) => Err(error),
            None => Ok(vec![self.record("default")]),
        }
    }
}

fn capability_for(ops: &[Operation], op: Operation) -> OperationCapability {
    OperationCapability {
        supported: ops.contains(&op),
        notes: None,
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> Source {
        self.source
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            id: self.id.clone(),
            source: self.source,
            search: capability_for(&self.ops, Operation::Search),
            fetch: capability_for(&self.ops, Operation::Fetch),
            crawl: capability_for(&self.ops, Operation::Crawl),
            post: capability_for(&self.ops, Operation::Post),
        }
    }

    async fn search(&self, _input: SearchInput, _ctx: &InvocationContext) -> Result<Vec<NormalizedRecord>, ProviderError> {
        if !self.ops.contains(&Operation::Search) {
            return Err(ProviderError::not_supported(&self.id, "search"));
        }
        self.take(Operation::Search)
    }

    async fn fetch(&self, _input: FetchInput, _ctx: &InvocationContext) -> Result<Vec<NormalizedRecord>, ProviderError> {
        if !self.ops.contains(&Operation::Fetch) {
            return Err(ProviderError::not_supported(&self.id, "fetch"));
        }
        self.take(Operation::Fetch)
    }

    async fn crawl(&self, _input: CrawlInput, _ctx: &InvocationContext) -> Result<Vec<NormalizedRecord>, ProviderError> {
        if !self.ops.contains(&Operation::Crawl) {
            return Err(ProviderError::not_supported(&self.id, "crawl"));
        }
        self.take(Operation::Crawl)
    }

    async fn post(&self, _input: PostInput, _ctx: &InvocationContext) -> Result<Vec<NormalizedRecord>, ProviderError> {
        if !self.ops.contains(&Operation::Post) {
            return Err(ProviderError::not_supported(&self.id, "post"));
        }
        self.take(Operation::Post)
    }

    async fn health_probe(&self) -> Option<Result<u64, ProviderError>> {
        self.health_probe_ms.lock().clone()
    }
}
