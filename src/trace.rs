//! Correlation envelope carried through every invocation (spec §3 "Trace context").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceContext {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provider_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TraceContext {
    /// A fresh trace for a new operation call (spec §3: "request id, unique per operation call").
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            session_id: None,
            target_id: None,
            provider_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Trace once the pipeline has bound a provider to this attempt.
    pub fn bound_to_provider(&self, provider_id: impl Into<String>) -> Self {
        let mut cloned = self.clone();
        cloned.provider_id = Some(provider_id.into());
        cloned
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_trace_gets_a_unique_request_id() {
        let a = TraceContext::new();
        let b = TraceContext::new();
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn binding_a_provider_preserves_request_id() {
        let trace = TraceContext::new();
        let bound = trace.bound_to_provider("web/a");
        assert_eq!(bound.request_id, trace.request_id);
        assert_eq!(bound.provider_id.as_deref(), Some("web/a"));
    }
}
