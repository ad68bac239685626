//! Canonical record shape and provider source taxonomy (spec §3).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the four provider categories the runtime federates across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Web,
    Community,
    Social,
    Shopping,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Web => "web",
            Source::Community => "community",
            Source::Social => "social",
            Source::Shopping => "shopping",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arbitrary JSON-shaped attribute bag, keyed by string (spec §3).
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// The canonical unit of provider output (spec §3 "Normalized record").
///
/// Invariant: id stability — two records with identical
/// `(provider, source, url, title, content, attributes)` yield identical ids
/// across runs (spec §8 invariant 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: String,
    pub source: Source,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Namespace UUID this crate mints deterministic record ids under (spec §3
/// invariant 1: stable across runs, so it must never change between builds).
const RECORD_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0xa1, 0x2c, 0x9e, 0x4f, 0x6b, 0x3d, 0x4c, 0x9a, 0x8e, 0x77, 0x1d, 0x02, 0x5f, 0x3a, 0x66, 0x10,
]);

/// Derives a stable record id from the fields the spec names as its identity:
/// `(provider, source, url, title, content, attributes)`.
pub fn derive_record_id(
    provider: &str,
    source: Source,
    url: Option<&str>,
    title: Option<&str>,
    content: Option<&str>,
    attributes: &Attributes,
) -> String {
    let attrs_json = serde_json::to_string(attributes).unwrap_or_default();
    let name = format!(
        "{provider}\u{1}{source}\u{1}{}\u{1}{}\u{1}{}\u{1}{attrs_json}",
        url.unwrap_or(""),
        title.unwrap_or(""),
        content.unwrap_or(""),
    );
    Uuid::new_v5(&RECORD_ID_NAMESPACE, name.as_bytes()).to_string()
}

/// Builder for a [`NormalizedRecord`] that fills in a deterministic id and
/// clamps confidence when the adapter doesn't supply an id directly.
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    pub id: Option<String>,
    pub source: Option<Source>,
    pub provider: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub confidence: Option<f64>,
    pub attributes: Attributes,
}

impl RecordBuilder {
    pub fn new(provider: impl Into<String>, source: Source) -> Self {
        Self {
            provider: Some(provider.into()),
            source: Some(source),
            ..Default::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> NormalizedRecord {
        let provider = self.provider.expect("provider is required");
        let source = self.source.expect("source is required");
        let id = self.id.unwrap_or_else(|| {
            derive_record_id(
                &provider,
                source,
                self.url.as_deref(),
                self.title.as_deref(),
                self.content.as_deref(),
                &self.attributes,
            )
        });
        let confidence = self.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
        NormalizedRecord {
            id,
            source,
            provider,
            url: self.url,
            title: self.title,
            content: self.content,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            confidence,
            attributes: self.attributes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_across_runs() {
        let a = derive_record_id(
            "web/a",
            Source::Web,
            Some("https://example.com"),
            Some("Title"),
            Some("Body"),
            &Attributes::new(),
        );
        let b = derive_record_id(
            "web/a",
            Source::Web,
            Some("https://example.com"),
            Some("Title"),
            Some("Body"),
            &Attributes::new(),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn id_changes_with_any_identity_field() {
        let base = derive_record_id("web/a", Source::Web, Some("u"), Some("t"), Some("c"), &Attributes::new());
        let different_url = derive_record_id("web/a", Source::Web, Some("u2"), Some("t"), Some("c"), &Attributes::new());
        assert_ne!(base, different_url);
    }

    #[test]
    fn confidence_is_clamped_into_unit_interval() {
        let record = RecordBuilder::new("web/a", Source::Web).confidence(5.0).build();
        assert_eq!(record.confidence, 1.0);
        let record = RecordBuilder::new("web/a", Source::Web).confidence(-5.0).build();
        assert_eq!(record.confidence, 0.0);
    }

    #[test]
    fn default_confidence_is_one_half() {
        let record = RecordBuilder::new("web/a", Source::Web).build();
        assert_eq!(record.confidence, 0.5);
    }

    #[test]
    fn explicit_id_is_preserved() {
        let record = RecordBuilder::new("web/a", Source::Web).id("explicit-id").build();
        assert_eq!(record.id, "explicit-id");
    }
}
