//! Invocation pipeline: the per-provider attempt loop (spec §4.7).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::adapter::{BrowserFallbackPort, CookiePolicy, InvocationContext, OperationInput, ProviderAdapter};
use crate::adaptive::{AdaptiveController, AdaptiveSnapshot, Observation};
use crate::antibot::{AntiBotPolicy, PostflightContext};
use crate::blocker::{self, BlockerClassifierInput, BlockerSignal, BlockerSource};
use crate::concurrency::{derive_scope_key, ConcurrencyGates};
use crate::config::{Operation, RuntimeConfig};
use crate::error::{looks_like_challenge, ErrorCode, ProviderError};
use crate::prompt_guard::{apply_guard, AuditEntry};
use crate::realism::{self, RealismPatternCode};
use crate::record::NormalizedRecord;
use crate::registry::Registry;
use crate::tier::{Tier, TierMetadata};
use crate::trace::TraceContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub provider: String,
    pub retrieval_path: String,
    pub retrieved_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub tier: Tier,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptGuardDiagnostics {
    pub enabled: bool,
    pub entries: Vec<AuditEntry>,
    pub quarantined_segments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealismDiagnostics {
    pub violation_count: usize,
    pub pattern_codes: Vec<RealismPatternCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub adaptive: AdaptiveSnapshot,
    pub prompt_guard: PromptGuardDiagnostics,
    pub realism: RealismDiagnostics,
}

#[derive(Debug, Clone)]
pub struct PipelineSuccess {
    pub records: Vec<NormalizedRecord>,
    pub trace: TraceContext,
    pub latency_ms: u64,
    pub attempts: u32,
    pub retries: u32,
    pub execution_metadata: ExecutionMetadata,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct PipelineFailure {
    pub error: ProviderError,
    pub trace: TraceContext,
    pub latency_ms: u64,
    pub attempts: u32,
    pub retries: u32,
    pub blocker: Option<BlockerSignal>,
    pub diagnostics: Diagnostics,
}

pub type PipelineOutcome = Result<PipelineSuccess, PipelineFailure>;

/// Per-attempt dependencies shared by the pipeline but owned by the runtime.
pub struct PipelineDeps<'a> {
    pub registry: &'a Registry,
    pub gates: &'a ConcurrencyGates,
    pub adaptive: &'a AdaptiveController,
    pub antibot: &'a AntiBotPolicy,
    pub config: &'a RuntimeConfig,
    pub browser_fallback: Option<&'a Arc<dyn BrowserFallbackPort>>,
}

fn attributes_with_security(
    mut record: NormalizedRecord,
    enabled: bool,
    quarantined_segments: Vec<String>,
    guard_entries: Vec<AuditEntry>,
) -> NormalizedRecord {
    let security = serde_json::json!({
        "untrustedContent": true,
        "dataOnlyContext": true,
        "promptGuardEnabled": enabled,
        "quarantinedSegments": quarantined_segments,
        "guardEntries": guard_entries,
    });
    record.attributes.insert("security".to_string(), security);
    record
}

/// Applies the prompt guard to every record's title/content (spec §4.9).
fn run_prompt_guard(
    records: Vec<NormalizedRecord>,
    enabled: bool,
) -> (Vec<NormalizedRecord>, PromptGuardDiagnostics) {
    let mut all_entries = Vec::new();
    let mut all_quarantined = Vec::new();

    let processed: Vec<NormalizedRecord> = records
        .into_iter()
        .map(|mut record| {
            if !enabled {
                return attributes_with_security(record, false, Vec::new(), Vec::new());
            }
            let (title, content, outcome) =
                apply_guard(&record.id, &record.provider, record.title.as_deref(), record.content.as_deref());
            record.title = title;
            record.content = content;
            all_entries.extend(outcome.audit.clone());
            all_quarantined.extend(outcome.quarantined_segments.clone());
            attributes_with_security(record, true, outcome.quarantined_segments, outcome.audit)
        })
        .collect();

    (
        processed,
        PromptGuardDiagnostics {
            enabled,
            entries: all_entries,
            quarantined_segments: all_quarantined,
        },
    )
}

fn run_realism_detector(records: &[NormalizedRecord], echo_candidate: Option<&str>) -> RealismDiagnostics {
    let mut codes = Vec::new();
    let mut count = 0usize;
    for record in records {
        let violations = realism::detect_violations(record, echo_candidate);
        count += violations.len();
        for v in violations {
            if !codes.contains(&v.pattern_code) {
                codes.push(v.pattern_code);
            }
        }
    }
    if count > 0 {
        tracing::warn!(violation_count = count, "realism_violation");
    }
    RealismDiagnostics {
        violation_count: count,
        pattern_codes: codes,
    }
}

fn echo_candidate_for(input: &OperationInput) -> Option<&str> {
    match input {
        OperationInput::Search(i) => Some(i.query.as_str()),
        OperationInput::Fetch(i) => Some(i.url.as_str()),
        _ => None,
    }
}

fn retries_for(op: Operation, config: &RuntimeConfig) -> u32 {
    match op {
        Operation::Post => config.budgets.retries.write,
        _ => config.budgets.retries.read,
    }
}

fn timeout_for(op: Operation, config: &RuntimeConfig, override_ms: Option<Duration>) -> Duration {
    override_ms.unwrap_or_else(|| config.budgets.timeouts.for_operation(op))
}

fn observation_from_error(latency_ms: u64, error: &ProviderError, queue_pressure: f64) -> Observation {
    Observation {
        latency_ms,
        timeout: error.code == ErrorCode::Timeout,
        challenge: looks_like_challenge(&error.message),
        http_4xx: error.status.map(|s| (400..500).contains(&s)).unwrap_or(false),
        http_5xx: error.status.map(|s| s >= 500).unwrap_or(false),
        queue_pressure,
    }
}

fn observation_success(latency_ms: u64, queue_pressure: f64) -> Observation {
    Observation {
        latency_ms,
        timeout: false,
        challenge: false,
        http_4xx: false,
        http_5xx: false,
        queue_pressure,
    }
}

/// Runs the full attempt loop for one provider under one tier (spec §4.7).
#[allow(clippy::too_many_arguments)]
pub async fn invoke(
    adapter: &Arc<dyn ProviderAdapter>,
    op: Operation,
    input: OperationInput,
    trace: TraceContext,
    tier: TierMetadata,
    deps: &PipelineDeps<'_>,
    timeout_override: Option<Duration>,
    use_cookies: bool,
    cookie_policy_override: Option<CookiePolicy>,
    cancellation: CancellationToken,
) -> PipelineOutcome {
    let started = Instant::now();
    let provider_id = adapter.id().to_string();
    let trace = trace.bound_to_provider(provider_id.clone());
    let scope_key = derive_scope_key(op, &input, &provider_id);
    deps.adaptive.sync_gates(deps.gates, &scope_key);

    let snapshot = deps.adaptive.snapshot(&scope_key);
    let empty_diagnostics = |prompt_guard_enabled: bool| Diagnostics {
        adaptive: snapshot,
        prompt_guard: PromptGuardDiagnostics {
            enabled: prompt_guard_enabled,
            entries: Vec::new(),
            quarantined_segments: Vec::new(),
        },
        realism: RealismDiagnostics {
            violation_count: 0,
            pattern_codes: Vec::new(),
        },
    };

    // Step 2: circuit check.
    if deps.registry.is_circuit_open(&provider_id) {
        let latched = deps
            .registry
            .get_circuit_error(&provider_id)
            .unwrap_or_else(|| ProviderError::new(ErrorCode::Unavailable, "circuit is open"));
        let error = ProviderError::circuit_open(&latched);
        return Err(PipelineFailure {
            error,
            trace,
            latency_ms: started.elapsed().as_millis() as u64,
            attempts: 0,
            retries: 0,
            blocker: None,
            diagnostics: empty_diagnostics(deps.config.prompt_injection_guard.enabled),
        });
    }

    let retries = retries_for(op, deps.config);
    let max_attempts = 1 + retries;
    let echo_candidate = echo_candidate_for(&input).map(str::to_string);
    let prompt_guard_enabled = deps.config.prompt_injection_guard.enabled;

    let mut last_error: Option<ProviderError> = None;
    let mut attempt_count = 0u32;

    for attempt in 1..=max_attempts {
        attempt_count = attempt;

        // 4a. Anti-bot preflight.
        let preflight = deps.antibot.preflight(&provider_id, op);
        if !preflight.allow {
            let error = ProviderError::new(ErrorCode::PolicyBlocked, "anti-bot cooldown is active")
                .with_retryable(false)
                .with_provider(provider_id.clone())
                .with_reason(preflight.reason_code.clone().unwrap_or_else(crate::error::ReasonCode::challenge_detected))
                .ensure_reason_code();
            last_error = Some(error);
            if attempt < max_attempts {
                continue;
            }
            break;
        }

        // 4b. Admission (limits already synced from the adaptive snapshot above).
        let _permit = deps.gates.admit(&scope_key).await;

        let global_pressure = deps.gates.global().pressure();
        let scope_pressure = deps.gates.scope(&scope_key).pressure();
        let queue_pressure = global_pressure.max(scope_pressure);

        let attempt_started = Instant::now();
        let attempt_token = cancellation.child_token();
        let ctx = InvocationContext {
            trace: trace.clone(),
            timeout: timeout_for(op, deps.config, timeout_override),
            attempt,
            cancellation: attempt_token.clone(),
            use_cookies,
            cookie_policy_override,
            browser_fallback_port: deps.browser_fallback.cloned(),
        };

        tracing::debug!(provider = %provider_id, op = %op, attempt, "provider_attempt");

        // 4c. Dispatch under a timeout.
        let dispatch = adapter.dispatch(input.clone(), &ctx);
        let dispatched = tokio::time::timeout(ctx.timeout, dispatch).await;
        let latency_ms = attempt_started.elapsed().as_millis() as u64;

        match dispatched {
            Ok(Ok(records)) => {
                // 4d. Prompt guard.
                let (records, prompt_guard_diagnostics) = run_prompt_guard(records, prompt_guard_enabled);
                // 4e. Realism detector.
                let realism_diagnostics = run_realism_detector(&records, echo_candidate.as_deref());
                // 4f. Observe adaptive signals.
                let observation = observation_success(latency_ms, queue_pressure);
                deps.adaptive.observe_global(observation);
                deps.adaptive.observe_scope(&scope_key, observation);
                // 4g. Mark success; anti-bot postflight success.
                deps.registry.mark_success(&provider_id, latency_ms);
                deps.antibot.postflight(
                    PostflightContext {
                        provider_id: provider_id.clone(),
                        op,
                        success: true,
                        reason_code: None,
                        retryable: false,
                        attempt,
                        max_attempts,
                    },
                    0,
                );
                tracing::debug!(provider = %provider_id, op = %op, attempt, "provider_success");

                let diagnostics = Diagnostics {
                    adaptive: deps.adaptive.snapshot(&scope_key),
                    prompt_guard: prompt_guard_diagnostics,
                    realism: realism_diagnostics,
                };
                return Ok(PipelineSuccess {
                    records,
                    trace: trace.clone(),
                    latency_ms: started.elapsed().as_millis() as u64,
                    attempts: attempt,
                    retries: attempt - 1,
                    execution_metadata: ExecutionMetadata {
                        tier: tier.selected,
                        provenance: Provenance {
                            provider: provider_id.clone(),
                            retrieval_path: format!("{op}:{scope_key}"),
                            retrieved_at: Utc::now(),
                        },
                    },
                    diagnostics,
                });
            }
            Ok(Err(mut error)) => {
                error = error.ensure_reason_code();
                let observation = observation_from_error(latency_ms, &error, queue_pressure);
                deps.adaptive.observe_global(observation);
                deps.adaptive.observe_scope(&scope_key, observation);
                deps.registry.mark_failure(&provider_id, error.clone(), &deps.config.budgets.circuit_breaker);

                let postflight = deps.antibot.postflight(
                    PostflightContext {
                        provider_id: provider_id.clone(),
                        op,
                        success: false,
                        reason_code: error.reason_code.clone(),
                        retryable: error.retryable,
                        attempt,
                        max_attempts,
                    },
                    deps.config.budgets.circuit_breaker.cooldown_ms,
                );
                tracing::debug!(provider = %provider_id, op = %op, attempt, code = ?error.code, "provider_failure");

                last_error = Some(error);
                if postflight.allow_retry && attempt < max_attempts {
                    continue;
                }
                break;
            }
            Err(_elapsed) => {
                attempt_token.cancel();
                let error = ProviderError::timeout(format!("operation '{op}' exceeded its deadline"))
                    .with_provider(provider_id.clone())
                    .ensure_reason_code();
                let observation = observation_from_error(latency_ms, &error, queue_pressure);
                deps.adaptive.observe_global(observation);
                deps.adaptive.observe_scope(&scope_key, observation);
                deps.registry.mark_failure(&provider_id, error.clone(), &deps.config.budgets.circuit_breaker);
                let postflight = deps.antibot.postflight(
                    PostflightContext {
                        provider_id: provider_id.clone(),
                        op,
                        success: false,
                        reason_code: error.reason_code.clone(),
                        retryable: error.retryable,
                        attempt,
                        max_attempts,
                    },
                    deps.config.budgets.circuit_breaker.cooldown_ms,
                );
                last_error = Some(error);
                if postflight.allow_retry && attempt < max_attempts {
                    continue;
                }
                break;
            }
        }
    }

    let error = last_error.unwrap_or_else(|| ProviderError::internal("attempt loop exhausted without a result"));
    let details_url = error
        .details
        .as_ref()
        .and_then(|d| d.get("url"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let blocker_input = BlockerClassifierInput {
        source: Some(BlockerSource::Network),
        url: details_url.clone(),
        final_url: details_url,
        title: None,
        status: error.status,
        provider_code: Some(error.code),
        message: Some(error.message.clone()),
        matched_patterns: Vec::new(),
        network_hosts: Vec::new(),
        trace_id: trace.request_id.clone(),
        retryable: error.retryable,
        env_limited: false,
        restricted_target: false,
        prompt_guard_enabled,
        confidence_threshold: deps.config.blocker_detection_threshold_clamped(),
        detected_at: Utc::now(),
    };
    let blocker = blocker::classify(&blocker_input);
    if let Some(signal) = &blocker {
        tracing::warn!(provider = %provider_id, blocker_type = ?signal.blocker_type, "blocker_classified");
    }

    Err(PipelineFailure {
        error,
        trace: trace.clone(),
        latency_ms: started.elapsed().as_millis() as u64,
        attempts: attempt_count,
        retries: attempt_count.saturating_sub(1),
        blocker,
        diagnostics: Diagnostics {
            adaptive: deps.adaptive.snapshot(&scope_key),
            prompt_guard: PromptGuardDiagnostics {
                enabled: prompt_guard_enabled,
                entries: Vec::new(),
                quarantined_segments: Vec::new(),
            },
            realism: RealismDiagnostics {
                violation_count: 0,
                pattern_codes: Vec::new(),
            },
        },
    })
}
