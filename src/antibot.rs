//! Anti-bot policy engine: per-(provider, operation) cooldown and retry
//! budget (spec §4.6).

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::{AntiBotPolicyConfig, Operation};
use crate::error::ReasonCode;

#[derive(Debug, Clone)]
struct CooldownEntry {
    reason_code: ReasonCode,
    cooldown_until: Instant,
    updated_at: Instant,
}

#[derive(Debug, Clone)]
pub struct PreflightDecision {
    pub allow: bool,
    pub reason_code: Option<ReasonCode>,
    pub retry_after_ms: Option<u64>,
    pub retry_guidance: Option<String>,
    pub proxy_hint: Option<String>,
    pub session_hint: Option<String>,
    pub escalation_intent: bool,
}

impl PreflightDecision {
    fn allowed() -> Self {
        Self {
            allow: true,
            reason_code: None,
            retry_after_ms: None,
            retry_guidance: None,
            proxy_hint: None,
            session_hint: None,
            escalation_intent: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostflightContext {
    pub provider_id: String,
    pub op: Operation,
    pub success: bool,
    pub reason_code: Option<ReasonCode>,
    pub retryable: bool,
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct PostflightDecision {
    pub allow_retry: bool,
    pub reason_code: Option<ReasonCode>,
    pub retry_after_ms: Option<u64>,
    pub escalation_intent: bool,
    pub proxy_hint: Option<String>,
    pub session_hint: Option<String>,
}

/// Reasons that trigger a new cooldown window on failure (spec §4.6 "On failure").
fn cooldown_worthy(reason: &ReasonCode) -> bool {
    matches!(
        reason.as_str(),
        ReasonCode::IP_BLOCKED
            | ReasonCode::TOKEN_REQUIRED
            | ReasonCode::AUTH_REQUIRED
            | ReasonCode::CHALLENGE_DETECTED
            | ReasonCode::RATE_LIMITED
    )
}

/// Reasons eligible for a browser-escalation hint (spec §4.6 "Preflight").
fn escalation_worthy(reason: &ReasonCode) -> bool {
    matches!(
        reason.as_str(),
        ReasonCode::IP_BLOCKED | ReasonCode::TOKEN_REQUIRED | ReasonCode::AUTH_REQUIRED | ReasonCode::CHALLENGE_DETECTED
    )
}

fn hints_for(reason: &ReasonCode) -> (Option<String>, Option<String>) {
    match reason.as_str() {
        ReasonCode::IP_BLOCKED => (Some("rotate_proxy".into()), None),
        ReasonCode::TOKEN_REQUIRED | ReasonCode::AUTH_REQUIRED => (None, Some("refresh_session".into())),
        _ => (None, None),
    }
}

pub struct AntiBotPolicy {
    config: AntiBotPolicyConfig,
    cooldowns: DashMap<String, CooldownEntry>,
}

fn key(provider_id: &str, op: Operation) -> String {
    format!("{provider_id}:{op}")
}

impl AntiBotPolicy {
    pub fn new(config: AntiBotPolicyConfig) -> Self {
        Self {
            config,
            cooldowns: DashMap::new(),
        }
    }

    /// Spec §4.6 "Preflight". Purges an expired entry as a side effect.
    pub fn preflight(&self, provider_id: &str, op: Operation) -> PreflightDecision {
        if !self.config.enabled {
            return PreflightDecision::allowed();
        }
        let map_key = key(provider_id, op);
        let now = Instant::now();

        let expired = self
            .cooldowns
            .get(&map_key)
            .map(|entry| entry.cooldown_until <= now)
            .unwrap_or(false);
        if expired {
            self.cooldowns.remove(&map_key);
        }

        let Some(entry) = self.cooldowns.get(&map_key) else {
            return PreflightDecision::allowed();
        };

        let retry_after_ms = entry.cooldown_until.saturating_duration_since(now).as_millis() as u64;
        let escalation_intent = self.config.allow_browser_escalation && escalation_worthy(&entry.reason_code);
        let (proxy_hint, session_hint) = hints_for(&entry.reason_code);
        PreflightDecision {
            allow: false,
            reason_code: Some(entry.reason_code.clone()),
            retry_after_ms: Some(retry_after_ms),
            retry_guidance: Some("retry_after_backoff".into()),
            proxy_hint,
            session_hint,
            escalation_intent,
        }
    }

    /// Spec §4.6 "Postflight".
    pub fn postflight(&self, ctx: PostflightContext, cooldown_ms: u64) -> PostflightDecision {
        if !self.config.enabled {
            return PostflightDecision {
                allow_retry: ctx.retryable && ctx.attempt < ctx.max_attempts,
                reason_code: ctx.reason_code,
                retry_after_ms: None,
                escalation_intent: false,
                proxy_hint: None,
                session_hint: None,
            };
        }

        let map_key = key(&ctx.provider_id, ctx.op);
        if ctx.success {
            self.cooldowns.remove(&map_key);
            return PostflightDecision {
                allow_retry: false,
                reason_code: None,
                retry_after_ms: None,
                escalation_intent: false,
                proxy_hint: None,
                session_hint: None,
            };
        }

        let mut escalation_intent = false;
        let mut proxy_hint = None;
        let mut session_hint = None;

        if let Some(reason) = &ctx.reason_code {
            if cooldown_worthy(reason) && cooldown_ms > 0 {
                let clamped = cooldown_ms.clamp(0, 300_000);
                let now = Instant::now();
                self.cooldowns.insert(
                    map_key,
                    CooldownEntry {
                        reason_code: reason.clone(),
                        cooldown_until: now + Duration::from_millis(clamped),
                        updated_at: now,
                    },
                );
                tracing::debug!(provider = %ctx.provider_id, op = %ctx.op, reason = %reason, "antibot_cooldown_set");
            }
            escalation_intent = self.config.allow_browser_escalation && escalation_worthy(reason);
            let hints = hints_for(reason);
            proxy_hint = hints.0;
            session_hint = hints.1;
        }

        let max_challenge_retries = self.config.max_challenge_retries_clamped();
        let challenge_exhausted = ctx
            .reason_code
            .as_ref()
            .map(|r| r.as_str() == ReasonCode::CHALLENGE_DETECTED)
            .unwrap_or(false)
            && ctx.attempt > max_challenge_retries + 1;

        let allow_retry = ctx.retryable && ctx.attempt < ctx.max_attempts && !challenge_exhausted;

        PostflightDecision {
            allow_retry,
            reason_code: ctx.reason_code,
            retry_after_ms: None,
            escalation_intent,
            proxy_hint,
            session_hint,
        }
    }
}
