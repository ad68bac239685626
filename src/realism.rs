//! Realism / placeholder detector: flags records that look synthesized
//! rather than retrieved (spec §4.10).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::record::NormalizedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealismPatternCode {
    PlaceholderLocalUrl,
    PlaceholderToken,
    EchoInput,
}

static PLACEHOLDER_LOCAL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https?://[^/]*\.(placeholder|synthetic|example)\.local(:\d+)?(/|$)")
        .expect("static pattern is valid")
});
static PLACEHOLDER_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(lorem ipsum|TODO|TBD|FIXME|<[a-z_]+>|\{\{[a-z_]+\}\}|placeholder)\b")
        .expect("static pattern is valid")
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealismViolation {
    pub pattern_code: RealismPatternCode,
    pub field: String,
    pub excerpt: String,
}

fn scan_field(field_name: &str, text: &str) -> Vec<RealismViolation> {
    let mut violations = Vec::new();
    if let Some(mat) = PLACEHOLDER_LOCAL_URL.find(text) {
        violations.push(RealismViolation {
            pattern_code: RealismPatternCode::PlaceholderLocalUrl,
            field: field_name.to_string(),
            excerpt: mat.as_str().to_string(),
        });
    }
    if let Some(mat) = PLACEHOLDER_TOKEN.find(text) {
        violations.push(RealismViolation {
            pattern_code: RealismPatternCode::PlaceholderToken,
            field: field_name.to_string(),
            excerpt: mat.as_str().to_string(),
        });
    }
    violations
}

/// True if `text` is, modulo whitespace and case, identical to `input` — an
/// adapter handing the query back as if it were a result (spec §4.10 "echoed
/// input").
fn is_echo(text: &str, input: &str) -> bool {
    let normalize = |s: &str| s.trim().to_lowercase();
    !input.trim().is_empty() && normalize(text) == normalize(input)
}

/// Scans a record's `url`/`title`/`content` for placeholder patterns and, when
/// `input_echo_candidate` is given (the caller's query or URL), for an
/// unchanged echo of it.
pub fn detect_violations(record: &NormalizedRecord, input_echo_candidate: Option<&str>) -> Vec<RealismViolation> {
    let mut violations = Vec::new();

    if let Some(url) = &record.url {
        violations.extend(scan_field("url", url));
    }
    if let Some(title) = &record.title {
        violations.extend(scan_field("title", title));
        if let Some(input) = input_echo_candidate {
            if is_echo(title, input) {
                violations.push(RealismViolation {
                    pattern_code: RealismPatternCode::EchoInput,
                    field: "title".to_string(),
                    excerpt: title.clone(),
                });
            }
        }
    }
    if let Some(content) = &record.content {
        violations.extend(scan_field("content", content));
        if let Some(input) = input_echo_candidate {
            if is_echo(content, input) {
                violations.push(RealismViolation {
                    pattern_code: RealismPatternCode::EchoInput,
                    field: "content".to_string(),
                    excerpt: content.clone(),
                });
            }
        }
    }

    violations
}
