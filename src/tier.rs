//! Tier router: a pure function from `(config, signals)` to tier metadata
//! (spec §4.3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    A,
    B,
    C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierReasonCode {
    DefaultTier,
    OperatorOverride,
    RestrictedSafeForced,
    ChallengePressure,
    HighFrictionTarget,
    HybridEligible,
    HybridUnhealthy,
    HybridRiskThreshold,
    HybridLatencyBudget,
    HybridErrorBudget,
    PolicyRestrictedSafe,
    RestrictedSafeRecovered,
    HybridDisabled,
    RestrictedSafeDisabled,
    FallbackToTierA,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierMetadata {
    pub selected: Tier,
    pub reason_code: TierReasonCode,
}

impl TierMetadata {
    pub fn new(selected: Tier, reason_code: TierReasonCode) -> Self {
        Self { selected, reason_code }
    }
}

/// `shouldFallbackToTierA` (spec §4.3): true iff tier != A.
pub fn should_fallback_to_tier_a(tier: Tier) -> bool {
    tier != Tier::A
}

pub fn fallback_tier_metadata() -> TierMetadata {
    TierMetadata::new(Tier::A, TierReasonCode::FallbackToTierA)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierRouterConfig {
    pub default_tier: Tier,
    pub enable_hybrid: bool,
    pub enable_restricted_safe: bool,
    #[serde(default = "default_hybrid_risk_threshold")]
    pub hybrid_risk_threshold: f64,
    #[serde(default = "default_recovery_interval_ms")]
    pub restricted_safe_recovery_interval_ms: u64,
}

fn default_hybrid_risk_threshold() -> f64 {
    0.6
}
fn default_recovery_interval_ms() -> u64 {
    60_000
}

impl Default for TierRouterConfig {
    fn default() -> Self {
        Self {
            default_tier: Tier::A,
            enable_hybrid: true,
            enable_restricted_safe: true,
            hybrid_risk_threshold: default_hybrid_risk_threshold(),
            restricted_safe_recovery_interval_ms: default_recovery_interval_ms(),
        }
    }
}

/// Caller- and runtime-observed signals the router consults (spec §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct TierSignals {
    pub preferred_tier: Option<Tier>,
    pub force_restricted_safe: bool,
    pub high_friction_target: bool,
    pub challenge_pressure: f64,
    pub risk_score: Option<f64>,
    pub hybrid_healthy: bool,
    pub policy_restricted_safe: bool,
    pub latency_budget_exceeded: bool,
    pub error_budget_exceeded: bool,
    pub hybrid_eligible: bool,
    pub recovery_stable_for_ms: u64,
    pub policy_allows_recovery: bool,
}

impl TierSignals {
    fn risk(&self) -> f64 {
        self.risk_score.unwrap_or(self.challenge_pressure)
    }
}

/// Evaluates the hybrid guard chain (spec §4.3 "Hybrid guards"), used both
/// when the default tier is B and when C attempts recovery into a hybrid
/// track.
fn evaluate_hybrid_guards(
    config: &TierRouterConfig,
    signals: &TierSignals,
    eligible_reason: TierReasonCode,
) -> TierMetadata {
    if !signals.hybrid_healthy {
        return TierMetadata::new(Tier::A, TierReasonCode::HybridUnhealthy);
    }
    if signals.risk() > config.hybrid_risk_threshold {
        return TierMetadata::new(Tier::A, TierReasonCode::HybridRiskThreshold);
    }
    if signals.latency_budget_exceeded {
        return TierMetadata::new(Tier::A, TierReasonCode::HybridLatencyBudget);
    }
    if signals.error_budget_exceeded {
        return TierMetadata::new(Tier::A, TierReasonCode::HybridErrorBudget);
    }
    TierMetadata::new(Tier::B, eligible_reason)
}

/// Pure tier-selection function (spec §4.3 "Decision order").
pub fn select_tier(config: &TierRouterConfig, signals: &TierSignals) -> TierMetadata {
    // 1. Preferred tier is selectable under config.
    if let Some(preferred) = signals.preferred_tier {
        let selectable = match preferred {
            Tier::A => true,
            Tier::B => config.enable_hybrid,
            Tier::C => config.enable_restricted_safe,
        };
        if selectable {
            return TierMetadata::new(preferred, TierReasonCode::OperatorOverride);
        }
    }

    if config.enable_restricted_safe {
        // 2. Policy-restricted-safe.
        if signals.policy_restricted_safe {
            return TierMetadata::new(Tier::C, TierReasonCode::PolicyRestrictedSafe);
        }
        // 3. Force-restricted-safe.
        if signals.force_restricted_safe {
            return TierMetadata::new(Tier::C, TierReasonCode::RestrictedSafeForced);
        }
        // 4. High-friction target.
        if signals.high_friction_target {
            return TierMetadata::new(Tier::C, TierReasonCode::HighFrictionTarget);
        }
        // 5. Challenge pressure.
        if signals.challenge_pressure >= 0.5 {
            return TierMetadata::new(Tier::C, TierReasonCode::ChallengePressure);
        }
    }

    match config.default_tier {
        Tier::C => {
            if !config.enable_restricted_safe {
                return TierMetadata::new(Tier::A, TierReasonCode::RestrictedSafeDisabled);
            }
            let recovery_eligible = signals.policy_allows_recovery
                && signals.recovery_stable_for_ms >= config.restricted_safe_recovery_interval_ms;
            if recovery_eligible {
                let hybrid = evaluate_hybrid_guards(config, signals, TierReasonCode::RestrictedSafeRecovered);
                return match hybrid.selected {
                    Tier::B => TierMetadata::new(Tier::B, TierReasonCode::RestrictedSafeRecovered),
                    _ => TierMetadata::new(Tier::A, TierReasonCode::RestrictedSafeRecovered),
                };
            }
            TierMetadata::new(Tier::C, TierReasonCode::DefaultTier)
        }
        Tier::B => {
            if !config.enable_hybrid {
                return TierMetadata::new(Tier::A, TierReasonCode::HybridDisabled);
            }
            if signals.hybrid_eligible {
                return evaluate_hybrid_guards(config, signals, TierReasonCode::DefaultTier);
            }
            TierMetadata::new(Tier::A, TierReasonCode::DefaultTier)
        }
        Tier::A => {
            if config.enable_hybrid && signals.hybrid_eligible {
                return evaluate_hybrid_guards(config, signals, TierReasonCode::HybridEligible);
            }
            TierMetadata::new(Tier::A, TierReasonCode::DefaultTier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_signals() -> TierSignals {
        TierSignals::default()
    }

    #[test]
    fn default_config_with_no_signals_selects_a() {
        let config = TierRouterConfig::default();
        let result = select_tier(&config, &base_signals());
        assert_eq!(result, TierMetadata::new(Tier::A, TierReasonCode::DefaultTier));
    }

    #[test]
    fn operator_override_wins_when_selectable() {
        let config = TierRouterConfig::default();
        let signals = TierSignals {
            preferred_tier: Some(Tier::C),
            ..base_signals()
        };
        let result = select_tier(&config, &signals);
        assert_eq!(result, TierMetadata::new(Tier::C, TierReasonCode::OperatorOverride));
    }

    #[test]
    fn operator_override_ignored_when_tier_disabled() {
        let mut config = TierRouterConfig::default();
        config.enable_restricted_safe = false;
        let signals = TierSignals {
            preferred_tier: Some(Tier::C),
            ..base_signals()
        };
        let result = select_tier(&config, &signals);
        assert_ne!(result.selected, Tier::C);
    }

    #[test]
    fn policy_restricted_safe_forces_c() {
        let config = TierRouterConfig::default();
        let signals = TierSignals {
            policy_restricted_safe: true,
            ..base_signals()
        };
        let result = select_tier(&config, &signals);
        assert_eq!(result, TierMetadata::new(Tier::C, TierReasonCode::PolicyRestrictedSafe));
    }

    #[test]
    fn challenge_pressure_threshold_forces_c() {
        let config = TierRouterConfig::default();
        let signals = TierSignals {
            challenge_pressure: 0.5,
            ..base_signals()
        };
        let result = select_tier(&config, &signals);
        assert_eq!(result, TierMetadata::new(Tier::C, TierReasonCode::ChallengePressure));
    }

    #[test]
    fn below_challenge_threshold_does_not_force_c() {
        let config = TierRouterConfig::default();
        let signals = TierSignals {
            challenge_pressure: 0.49,
            ..base_signals()
        };
        let result = select_tier(&config, &signals);
        assert_ne!(result.selected, Tier::C);
    }

    #[test]
    fn default_b_with_hybrid_disabled_falls_back_to_a() {
        let mut config = TierRouterConfig::default();
        config.default_tier = Tier::B;
        config.enable_hybrid = false;
        let result = select_tier(&config, &base_signals());
        assert_eq!(result, TierMetadata::new(Tier::A, TierReasonCode::HybridDisabled));
    }

    #[test]
    fn default_b_hybrid_eligible_and_healthy_selects_b() {
        let mut config = TierRouterConfig::default();
        config.default_tier = Tier::B;
        let signals = TierSignals {
            hybrid_eligible: true,
            hybrid_healthy: true,
            ..base_signals()
        };
        let result = select_tier(&config, &signals);
        assert_eq!(result, TierMetadata::new(Tier::B, TierReasonCode::DefaultTier));
    }

    #[test]
    fn hybrid_risk_above_threshold_demotes_to_a() {
        let mut config = TierRouterConfig::default();
        config.default_tier = Tier::B;
        let signals = TierSignals {
            hybrid_eligible: true,
            hybrid_healthy: true,
            risk_score: Some(0.9),
            ..base_signals()
        };
        let result = select_tier(&config, &signals);
        assert_eq!(result, TierMetadata::new(Tier::A, TierReasonCode::HybridRiskThreshold));
    }

    #[test]
    fn default_c_disabled_restricted_safe_selects_a() {
        let mut config = TierRouterConfig::default();
        config.default_tier = Tier::C;
        config.enable_restricted_safe = false;
        let result = select_tier(&config, &base_signals());
        assert_eq!(result, TierMetadata::new(Tier::A, TierReasonCode::RestrictedSafeDisabled));
    }

    #[test]
    fn default_c_recovers_to_b_when_stable_and_healthy() {
        let mut config = TierRouterConfig::default();
        config.default_tier = Tier::C;
        let signals = TierSignals {
            policy_allows_recovery: true,
            recovery_stable_for_ms: config.restricted_safe_recovery_interval_ms,
            hybrid_healthy: true,
            ..base_signals()
        };
        let result = select_tier(&config, &signals);
        assert_eq!(result, TierMetadata::new(Tier::B, TierReasonCode::RestrictedSafeRecovered));
    }

    #[test]
    fn default_c_stays_c_without_recovery() {
        let mut config = TierRouterConfig::default();
        config.default_tier = Tier::C;
        let result = select_tier(&config, &base_signals());
        assert_eq!(result, TierMetadata::new(Tier::C, TierReasonCode::DefaultTier));
    }

    #[test]
    fn fallback_metadata_is_always_a() {
        assert_eq!(fallback_tier_metadata(), TierMetadata::new(Tier::A, TierReasonCode::FallbackToTierA));
    }

    #[test]
    fn should_fallback_is_true_for_non_a_tiers() {
        assert!(!should_fallback_to_tier_a(Tier::A));
        assert!(should_fallback_to_tier_a(Tier::B));
        assert!(should_fallback_to_tier_a(Tier::C));
    }
}
