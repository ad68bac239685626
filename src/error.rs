//! Wire error shape and reason-code derivation (spec §6 "Error wire shape", §7).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Source;

/// Closed structural error vocabulary (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidInput,
    Timeout,
    Network,
    RateLimited,
    Auth,
    Upstream,
    NotSupported,
    PolicyBlocked,
    CircuitOpen,
    Unavailable,
    Internal,
}

impl ErrorCode {
    /// Whether this structural code is retryable by default, absent an adapter override.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::Network | ErrorCode::RateLimited | ErrorCode::Upstream
        )
    }
}

/// Open-vocabulary failure reason, independent of the structural [`ErrorCode`].
///
/// The spec enumerates a handful of well-known codes but explicitly allows
/// adapter-specific reasons ("caption/transcript-specific reasons pass through
/// unchanged") to flow through untouched, so this is a string newtype with
/// constructors for the well-known values rather than a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReasonCode(pub String);

impl ReasonCode {
    pub const TOKEN_REQUIRED: &'static str = "token_required";
    pub const AUTH_REQUIRED: &'static str = "auth_required";
    pub const RATE_LIMITED: &'static str = "rate_limited";
    pub const IP_BLOCKED: &'static str = "ip_blocked";
    pub const ENV_LIMITED: &'static str = "env_limited";
    pub const CHALLENGE_DETECTED: &'static str = "challenge_detected";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn token_required() -> Self {
        Self::new(Self::TOKEN_REQUIRED)
    }
    pub fn auth_required() -> Self {
        Self::new(Self::AUTH_REQUIRED)
    }
    pub fn rate_limited() -> Self {
        Self::new(Self::RATE_LIMITED)
    }
    pub fn ip_blocked() -> Self {
        Self::new(Self::IP_BLOCKED)
    }
    pub fn env_limited() -> Self {
        Self::new(Self::ENV_LIMITED)
    }
    pub fn challenge_detected() -> Self {
        Self::new(Self::CHALLENGE_DETECTED)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ReasonCode {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-provider typed failure, crossing the public boundary as a value, never
/// as a panic or a thrown exception (spec §7 "Propagation policy").
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
#[non_exhaustive]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason_code: Option<ReasonCode>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<serde_json::Value>,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.default_retryable();
        Self {
            code,
            message: message.into(),
            retryable,
            reason_code: None,
            provider: None,
            source: None,
            status: None,
            details: None,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_reason(mut self, reason: ReasonCode) -> Self {
        self.reason_code = Some(reason);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn circuit_open(latched: &ProviderError) -> Self {
        Self::new(ErrorCode::CircuitOpen, latched.message.clone())
            .with_retryable(false)
            .with_provider(latched.provider.clone().unwrap_or_default())
    }

    pub fn not_supported(provider: impl Into<String>, op: &str) -> Self {
        Self::new(
            ErrorCode::NotSupported,
            format!("operation '{op}' is not supported by this provider"),
        )
        .with_retryable(false)
        .with_provider(provider)
    }

    /// Ensures a reason code is present, deriving one from `(code, message,
    /// status, details)` per spec §7 when the error doesn't already carry one.
    pub fn ensure_reason_code(mut self) -> Self {
        if self.reason_code.is_none() {
            self.reason_code = derive_reason_code(self.code, &self.message, self.status);
        }
        self
    }
}

static CHALLENGE_PATTERN: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"(?i)challenge|captcha|verify|interstitial|cf_chl|bot|prove your humanity")
        .expect("static challenge pattern is valid")
});

/// Message-level challenge-keyword match, shared between reason-code
/// derivation and the blocker classifier (spec §4.11 rule 2).
pub fn looks_like_challenge(text: &str) -> bool {
    CHALLENGE_PATTERN.is_match(text)
}

/// Reason-code derivation table (spec §7).
pub fn derive_reason_code(code: ErrorCode, message: &str, status: Option<u16>) -> Option<ReasonCode> {
    if matches!(status, Some(401) | Some(403)) || code == ErrorCode::Auth {
        return Some(ReasonCode::token_required());
    }
    if matches!(status, Some(429)) || code == ErrorCode::RateLimited {
        return Some(ReasonCode::rate_limited());
    }
    if code == ErrorCode::Upstream || matches!(status, Some(s) if s >= 500) {
        return Some(ReasonCode::ip_blocked());
    }
    if matches!(code, ErrorCode::Timeout | ErrorCode::Network | ErrorCode::Unavailable) {
        return Some(ReasonCode::env_limited());
    }
    if looks_like_challenge(message) {
        return Some(ReasonCode::challenge_detected());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_status_derives_token_required() {
        let reason = derive_reason_code(ErrorCode::Internal, "denied", Some(401));
        assert_eq!(reason, Some(ReasonCode::token_required()));
    }

    #[test]
    fn rate_limited_status_derives_rate_limited() {
        let reason = derive_reason_code(ErrorCode::Internal, "too many requests", Some(429));
        assert_eq!(reason, Some(ReasonCode::rate_limited()));
    }

    #[test]
    fn five_xx_derives_ip_blocked() {
        let reason = derive_reason_code(ErrorCode::Upstream, "retrieval failed", Some(503));
        assert_eq!(reason, Some(ReasonCode::ip_blocked()));
    }

    #[test]
    fn timeout_code_derives_env_limited() {
        let reason = derive_reason_code(ErrorCode::Timeout, "deadline exceeded", None);
        assert_eq!(reason, Some(ReasonCode::env_limited()));
    }

    #[test]
    fn challenge_message_is_detected_last() {
        let reason = derive_reason_code(ErrorCode::Internal, "please complete the captcha", None);
        assert_eq!(reason, Some(ReasonCode::challenge_detected()));
    }

    #[test]
    fn unrecognized_failure_has_no_reason() {
        let reason = derive_reason_code(ErrorCode::Internal, "weird failure", None);
        assert_eq!(reason, None);
    }

    #[test]
    fn ensure_reason_code_does_not_override_existing() {
        let err = ProviderError::new(ErrorCode::Internal, "transcript_unavailable")
            .with_reason(ReasonCode::new("transcript_unavailable"))
            .ensure_reason_code();
        assert_eq!(err.reason_code.unwrap().as_str(), "transcript_unavailable");
    }
}
