//! Provider selection (spec §4.2).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::adapter::ProviderAdapter;
use crate::config::Operation;
use crate::record::Source;
use crate::registry::Registry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum SelectionMode {
    #[default]
    Auto,
    Source(Source),
    All,
}

/// Deterministic default ordering for `auto`: web first (cheapest, least
/// friction), then community, social, shopping.
const AUTO_ORDER: [Source; 4] = [Source::Web, Source::Community, Source::Social, Source::Shopping];

fn supports(adapter: &dyn ProviderAdapter, op: Operation) -> bool {
    let caps = adapter.capabilities();
    match op {
        Operation::Search => caps.search.supported,
        Operation::Fetch => caps.fetch.supported,
        Operation::Crawl => caps.crawl.supported,
        Operation::Post => caps.post.supported,
    }
}

/// Returns an ordered list of adapters supporting `op` under `mode`, further
/// filtered by `allow_list` when non-empty (spec §4.2).
pub fn select_providers(
    registry: &Registry,
    op: Operation,
    mode: &SelectionMode,
    allow_list: Option<&[String]>,
) -> Vec<Arc<dyn ProviderAdapter>> {
    let mut candidates: Vec<Arc<dyn ProviderAdapter>> = match mode {
        SelectionMode::Auto => {
            let mut ordered = Vec::new();
            for source in AUTO_ORDER {
                let mut of_source: Vec<_> = registry
                    .list()
                    .into_iter()
                    .filter(|a| a.source() == source && supports(a.as_ref(), op))
                    .collect();
                ordered.append(&mut of_source);
            }
            ordered
        }
        SelectionMode::Source(source) => registry
            .list()
            .into_iter()
            .filter(|a| a.source() == *source && supports(a.as_ref(), op))
            .collect(),
        SelectionMode::All => registry
            .list()
            .into_iter()
            .filter(|a| supports(a.as_ref(), op))
            .collect(),
    };

    if let Some(allow) = allow_list {
        if !allow.is_empty() {
            candidates.retain(|a| allow.iter().any(|id| id == a.id()));
        }
    }
    candidates
}
