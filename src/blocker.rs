//! Blocker classifier: turns an obstructed attempt into a structured signal
//! (spec §4.11).

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{looks_like_challenge, ErrorCode};
use crate::prompt_guard::apply_guard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerSource {
    Navigation,
    Network,
    Console,
    RuntimeFetch,
    MacroExecution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerType {
    AuthRequired,
    AntiBotChallenge,
    RateLimited,
    UpstreamBlock,
    RestrictedTarget,
    EnvLimited,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionHint {
    pub action: String,
    pub priority: u8,
}

fn hints(hint_type: BlockerType) -> Vec<ActionHint> {
    let actions: &[&str] = match hint_type {
        BlockerType::AuthRequired => &["manual_login", "switch_managed_headed", "switch_extension_mode"],
        BlockerType::AntiBotChallenge => &["solve_challenge_headed", "switch_extension_mode", "rotate_proxy"],
        BlockerType::RateLimited => &["retry_after_backoff", "collect_debug_trace"],
        BlockerType::UpstreamBlock => &["retry_after_backoff", "rotate_proxy", "collect_debug_trace"],
        BlockerType::RestrictedTarget => &["switch_target", "collect_debug_trace"],
        BlockerType::EnvLimited => &["escalate_environment", "collect_debug_trace"],
        BlockerType::Unknown => &["collect_debug_trace"],
    };
    actions
        .iter()
        .enumerate()
        .map(|(i, action)| ActionHint {
            action: action.to_string(),
            priority: (i + 1) as u8,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerEvidence {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub final_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provider_code: Option<ErrorCode>,
    pub matched_pattern_ids: Vec<String>,
    pub observed_hosts: Vec<String>,
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerSignal {
    #[serde(rename = "type")]
    pub blocker_type: BlockerType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason_code: Option<String>,
    pub source: BlockerSource,
    pub confidence: f64,
    pub retryable: bool,
    pub detected_at: DateTime<Utc>,
    pub evidence: BlockerEvidence,
    pub action_hints: Vec<ActionHint>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sanitation_diagnostics: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct BlockerClassifierInput {
    pub source: Option<BlockerSource>,
    pub url: Option<String>,
    pub final_url: Option<String>,
    pub title: Option<String>,
    pub status: Option<u16>,
    pub provider_code: Option<ErrorCode>,
    pub message: Option<String>,
    pub matched_patterns: Vec<String>,
    pub network_hosts: Vec<String>,
    pub trace_id: String,
    pub retryable: bool,
    pub env_limited: bool,
    pub restricted_target: bool,
    pub prompt_guard_enabled: bool,
    pub confidence_threshold: f64,
    pub detected_at: DateTime<Utc>,
}

static AUTH_URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/(login|signin|sign-in|auth|oauth)(/|\?|$)").expect("static pattern is valid"));
static AUTH_TITLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(log in|sign in|authentication required)").expect("static pattern is valid")
});
static RESTRICTED_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(chrome://|chrome-extension://|about:blank|devtools://)").expect("static pattern is valid")
});
static ENV_LIMITED_MESSAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(environment|sandbox|capability) (is )?(unavailable|not available|missing)")
        .expect("static pattern is valid")
});
static STATIC_BLOCKED_HOST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(blocked|banned)\.").expect("static pattern is valid"));
static RETRIEVAL_FAILED_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)retrieval failed").expect("static pattern is valid"));
static CHALLENGE_HOST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(recaptcha|hcaptcha|challenges\.cloudflare)").expect("static pattern is valid")
});
static CHALLENGE_TOKEN_URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)cf_chl|__cf_chl").expect("static pattern is valid"));

fn is_loopback_host(host: &str) -> bool {
    let host = host.trim().to_lowercase();
    host == "localhost" || host == "::1" || host.starts_with("127.")
}

fn url_host(url: &str) -> Option<String> {
    url::Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

fn normalize_hosts(input: &BlockerClassifierInput) -> Vec<String> {
    let mut hosts: Vec<String> = input.network_hosts.iter().map(|h| h.to_lowercase()).collect();
    for candidate in [&input.url, &input.final_url].into_iter().flatten() {
        if let Some(host) = url_host(candidate) {
            hosts.push(host);
        }
    }
    hosts.sort();
    hosts.dedup();
    hosts.truncate(20);
    hosts
}

/// Pure classification function (spec §4.11). Preprocesses title/message
/// through the prompt guard, then evaluates the fixed rule order and emits a
/// signal only when its confidence clears `confidence_threshold`.
pub fn classify(input: &BlockerClassifierInput) -> Option<BlockerSignal> {
    let (sanitized_title, sanitized_message, sanitation) = apply_guard(input.title.as_deref(), input.message.as_deref());
    let sanitation_diagnostics = if sanitation.audit.is_empty() {
        None
    } else {
        serde_json::to_value(&sanitation).ok()
    };

    let hosts = normalize_hosts(input);
    let threshold = input.confidence_threshold.clamp(0.0, 1.0);
    let source = input.source.unwrap_or(BlockerSource::Network);
    let title = sanitized_title.unwrap_or_default();
    let message = sanitized_message.unwrap_or_default();
    let url = input.url.as_deref().unwrap_or("");
    let final_url = input.final_url.as_deref().unwrap_or("");

    let evidence = |matched: Vec<&str>| BlockerEvidence {
        url: input.url.clone(),
        final_url: input.final_url.clone(),
        title: if title.is_empty() { None } else { Some(title.clone()) },
        status: input.status,
        provider_code: input.provider_code,
        matched_pattern_ids: matched.into_iter().map(str::to_string).collect(),
        observed_hosts: hosts.clone(),
        trace_id: input.trace_id.clone(),
    };

    // 1. auth_required
    {
        let status_hit = matches!(input.status, Some(401) | Some(403));
        let code_hit = input.provider_code == Some(ErrorCode::Auth);
        let url_hit = AUTH_URL_PATTERN.is_match(url) || AUTH_URL_PATTERN.is_match(final_url);
        let title_hit = AUTH_TITLE_PATTERN.is_match(&title);
        if status_hit || code_hit || url_hit || title_hit {
            let mut confidence: f64 = 0.90;
            if status_hit {
                confidence = confidence.max(0.97);
            } else if code_hit {
                confidence = confidence.max(0.93);
            } else if url_hit {
                confidence = confidence.max(0.91);
            } else if title_hit {
                confidence = confidence.max(0.90);
            }
            let mut matched = Vec::new();
            if url_hit {
                matched.push("auth_url_pattern");
            }
            if title_hit {
                matched.push("auth_title_pattern");
            }
            return finalize(
                BlockerType::AuthRequired,
                Some("token_required"),
                source,
                confidence,
                false,
                input.detected_at,
                evidence(matched),
                sanitation_diagnostics,
                threshold,
            );
        }
    }

    // 2. anti_bot_challenge (suppressed on loopback)
    {
        let loopback = hosts.iter().any(|h| is_loopback_host(h))
            || url_host(url).map(|h| is_loopback_host(&h)).unwrap_or(false);
        if !loopback {
            let keyword_hit = looks_like_challenge(&title) || looks_like_challenge(&message);
            let url_token_hit = CHALLENGE_TOKEN_URL_PATTERN.is_match(url);
            let status_title_hit = input.status == Some(200) && looks_like_challenge(&title);
            let host_hit = hosts.iter().any(|h| CHALLENGE_HOST_PATTERN.is_match(h));
            if keyword_hit || url_token_hit || status_title_hit || host_hit {
                let mut confidence: f64 = 0.88;
                if host_hit {
                    confidence = confidence.max(0.96);
                } else if url_token_hit {
                    confidence = confidence.max(0.93);
                } else if keyword_hit || status_title_hit {
                    confidence = confidence.max(0.90);
                }
                let mut matched = Vec::new();
                if keyword_hit {
                    matched.push("challenge_keyword");
                }
                if url_token_hit {
                    matched.push("challenge_url_token");
                }
                if host_hit {
                    matched.push("challenge_host");
                }
                return finalize(
                    BlockerType::AntiBotChallenge,
                    Some("challenge_detected"),
                    source,
                    confidence,
                    false,
                    input.detected_at,
                    evidence(matched),
                    sanitation_diagnostics,
                    threshold,
                );
            }
        }
    }

    // 3. rate_limited
    {
        let status_hit = input.status == Some(429);
        let code_hit = input.provider_code == Some(ErrorCode::RateLimited);
        if status_hit || code_hit {
            return finalize(
                BlockerType::RateLimited,
                Some("rate_limited"),
                source,
                0.95,
                true,
                input.detected_at,
                evidence(vec![]),
                sanitation_diagnostics,
                threshold,
            );
        }
    }

    // 4. upstream_block
    {
        let code_hit = matches!(
            input.provider_code,
            Some(ErrorCode::Upstream) | Some(ErrorCode::Network) | Some(ErrorCode::Unavailable)
        );
        let static_host_hit = hosts.iter().any(|h| STATIC_BLOCKED_HOST_PATTERN.is_match(h));
        let message_hit = RETRIEVAL_FAILED_PATTERN.is_match(&message);
        let status_hit = input.status.map(|s| s >= 500).unwrap_or(false);
        if code_hit && (static_host_hit || message_hit || status_hit) {
            let confidence = if static_host_hit { 0.9 } else { 0.8 };
            return finalize(
                BlockerType::UpstreamBlock,
                Some("ip_blocked"),
                source,
                confidence,
                input.retryable,
                input.detected_at,
                evidence(vec![]),
                sanitation_diagnostics,
                threshold,
            );
        }
    }

    // 5. restricted_target
    {
        let url_hit = RESTRICTED_URL_PATTERN.is_match(url) || RESTRICTED_URL_PATTERN.is_match(final_url);
        if url_hit || input.restricted_target {
            return finalize(
                BlockerType::RestrictedTarget,
                None,
                source,
                0.92,
                false,
                input.detected_at,
                evidence(vec![]),
                sanitation_diagnostics,
                threshold,
            );
        }
    }

    // 6. env_limited
    {
        let code_hit = input.provider_code == Some(ErrorCode::Unavailable) && ENV_LIMITED_MESSAGE_PATTERN.is_match(&message);
        if input.env_limited || code_hit {
            let confidence = if input.env_limited { 0.9 } else { 0.78 };
            return finalize(
                BlockerType::EnvLimited,
                Some("env_limited"),
                source,
                confidence,
                input.retryable,
                input.detected_at,
                evidence(vec![]),
                sanitation_diagnostics,
                threshold,
            );
        }
    }

    // 7. unknown
    {
        let has_signal = input.status.is_some()
            || input.provider_code.is_some()
            || !title.is_empty()
            || !message.is_empty()
            || !hosts.is_empty();
        if has_signal {
            return finalize(
                BlockerType::Unknown,
                None,
                source,
                0.5,
                input.retryable,
                input.detected_at,
                evidence(vec![]),
                sanitation_diagnostics,
                threshold,
            );
        }
    }

    None
}

#[allow(clippy::too_many_arguments)]
fn finalize(
    blocker_type: BlockerType,
    reason_code: Option<&str>,
    source: BlockerSource,
    confidence: f64,
    retryable: bool,
    detected_at: DateTime<Utc>,
    evidence: BlockerEvidence,
    sanitation_diagnostics: Option<serde_json::Value>,
    threshold: f64,
) -> Option<BlockerSignal> {
    let confidence = confidence.clamp(0.0, 1.0);
    if confidence < threshold {
        return None;
    }
    Some(BlockerSignal {
        blocker_type,
        reason_code: reason_code.map(str::to_string),
        source,
        confidence,
        retryable,
        detected_at,
        evidence,
        action_hints: hints(blocker_type),
        sanitation_diagnostics,
    })
}
