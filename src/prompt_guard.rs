//! Prompt-injection guard: ordered pattern rules applied to provider output
//! before it is handed back to callers (spec §4.9).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardAction {
    Quarantine,
    Strip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePatternId {
    IgnorePreviousInstructions,
    RevealSystemPrompt,
    PromptInjectionMarker,
    CredentialExfiltration,
    ToolAbuseDirective,
    RevealHiddenData,
}

impl RulePatternId {
    fn action(self) -> GuardAction {
        match self {
            RulePatternId::IgnorePreviousInstructions
            | RulePatternId::RevealSystemPrompt
            | RulePatternId::CredentialExfiltration
            | RulePatternId::ToolAbuseDirective => GuardAction::Quarantine,
            RulePatternId::PromptInjectionMarker | RulePatternId::RevealHiddenData => GuardAction::Strip,
        }
    }
}

struct Rule {
    pattern_id: RulePatternId,
    regex: &'static LazyLock<Regex>,
}

static IGNORE_PREVIOUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ignore (all )?(previous|prior|above) instructions").expect("static pattern is valid")
});
static REVEAL_SYSTEM_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reveal (your |the )?system prompt").expect("static pattern is valid"));
static PROMPT_INJECTION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[(system|assistant)\]:|<\|im_start\|>").expect("static pattern is valid"));
static CREDENTIAL_EXFILTRATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(send|leak|exfiltrate) (your |the )?(api key|password|credentials|token)")
        .expect("static pattern is valid")
});
static TOOL_ABUSE_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(call|invoke|execute) (the )?(tool|function|shell|command)\b.*(delete|rm -rf|drop table)")
        .expect("static pattern is valid")
});
static REVEAL_HIDDEN_DATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reveal (hidden|internal) (data|notes|metadata)").expect("static pattern is valid"));

/// Ordered rule list; order determines which pattern wins when spans overlap.
static RULES: &[Rule] = &[
    Rule {
        pattern_id: RulePatternId::IgnorePreviousInstructions,
        regex: &IGNORE_PREVIOUS,
    },
    Rule {
        pattern_id: RulePatternId::RevealSystemPrompt,
        regex: &REVEAL_SYSTEM_PROMPT,
    },
    Rule {
        pattern_id: RulePatternId::CredentialExfiltration,
        regex: &CREDENTIAL_EXFILTRATION,
    },
    Rule {
        pattern_id: RulePatternId::ToolAbuseDirective,
        regex: &TOOL_ABUSE_DIRECTIVE,
    },
    Rule {
        pattern_id: RulePatternId::PromptInjectionMarker,
        regex: &PROMPT_INJECTION_MARKER,
    },
    Rule {
        pattern_id: RulePatternId::RevealHiddenData,
        regex: &REVEAL_HIDDEN_DATA,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardSeverity {
    High,
    Medium,
}

impl RulePatternId {
    fn severity(self) -> GuardSeverity {
        match self.action() {
            GuardAction::Quarantine => GuardSeverity::High,
            GuardAction::Strip => GuardSeverity::Medium,
        }
    }
}

/// Cap on `AuditEntry::excerpt` (spec §4.9 "excerpt ≤ 120 chars").
const EXCERPT_MAX_CHARS: usize = 120;

fn truncate_excerpt(text: &str) -> String {
    match text.char_indices().nth(EXCERPT_MAX_CHARS) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub record_id: String,
    pub provider: String,
    pub field: String,
    pub pattern_id: RulePatternId,
    pub severity: GuardSeverity,
    pub action: GuardAction,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardOutcome {
    pub quarantined: bool,
    pub quarantined_segments: Vec<String>,
    pub audit: Vec<AuditEntry>,
}

impl GuardOutcome {
    fn clean() -> Self {
        Self {
            quarantined: false,
            quarantined_segments: Vec::new(),
            audit: Vec::new(),
        }
    }
}

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static pattern is valid"));

/// Bracketed sentinel a quarantine action leaves in place of the matched span
/// (spec §4.9 "quarantine replaces the match with a bracketed sentinel").
const QUARANTINE_SENTINEL: &str = "[REDACTED]";

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RUN.replace_all(text, " ").trim().to_string()
}

/// Applies every rule, in order, to `field` (a record's title or content).
/// A quarantine rule replaces each matched span with [`QUARANTINE_SENTINEL`]
/// and records the original text separately; a strip rule replaces it with
/// whitespace. Every occurrence of a rule's pattern is matched and replaced,
/// not just the first (spec §4.9 "every match emits an audit entry"). Runs of
/// whitespace are collapsed afterward. Applying the guard twice to its own
/// output is a no-op (spec invariant 7): the sentinel text and single spaces
/// left behind don't match any rule.
fn scan_and_transform(record_id: &str, provider: &str, field_name: &str, text: &str) -> (String, GuardOutcome) {
    let mut outcome = GuardOutcome::clean();
    let mut cursor = text.to_string();

    for rule in RULES {
        let action = rule.pattern_id.action();
        let replacement = match action {
            GuardAction::Quarantine => QUARANTINE_SENTINEL,
            GuardAction::Strip => " ",
        };

        let mut rebuilt = String::with_capacity(cursor.len());
        let mut last_end = 0;
        let mut matched_any = false;

        for mat in rule.regex.find_iter(&cursor) {
            matched_any = true;
            rebuilt.push_str(&cursor[last_end..mat.start()]);
            rebuilt.push_str(replacement);
            last_end = mat.end();

            let matched_text = mat.as_str().to_string();
            if action == GuardAction::Quarantine {
                outcome.quarantined = true;
                outcome.quarantined_segments.push(matched_text.clone());
            }
            outcome.audit.push(AuditEntry {
                record_id: record_id.to_string(),
                provider: provider.to_string(),
                field: field_name.to_string(),
                pattern_id: rule.pattern_id,
                severity: rule.pattern_id.severity(),
                action,
                excerpt: truncate_excerpt(&matched_text),
            });
        }

        if matched_any {
            rebuilt.push_str(&cursor[last_end..]);
            cursor = rebuilt;
        }
    }

    (collapse_whitespace(&cursor), outcome)
}

/// Scans `title` and `content`, returning the cleaned fields and a merged
/// [`GuardOutcome`] (spec §4.9 "apply to title and content").
pub fn apply_guard(
    record_id: &str,
    provider: &str,
    title: Option<&str>,
    content: Option<&str>,
) -> (Option<String>, Option<String>, GuardOutcome) {
    let mut merged = GuardOutcome::clean();

    let cleaned_title = title.map(|t| {
        let (cleaned, outcome) = scan_and_transform(record_id, provider, "title", t);
        merged.quarantined |= outcome.quarantined;
        merged.quarantined_segments.extend(outcome.quarantined_segments);
        merged.audit.extend(outcome.audit);
        cleaned
    });

    let cleaned_content = content.map(|c| {
        let (cleaned, outcome) = scan_and_transform(record_id, provider, "content", c);
        merged.quarantined |= outcome.quarantined;
        merged.quarantined_segments.extend(outcome.quarantined_segments);
        merged.audit.extend(outcome.audit);
        cleaned
    });

    (cleaned_title, cleaned_content, merged)
}
