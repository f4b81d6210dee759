//! Risk scoring.
//!
//! Pipeline per request:
//! 1. start from the profile's base score
//! 2. apply matching scoring rules in priority order (order matters here)
//! 3. multiply by every profile multiplier whose factor is active
//! 4. compute five capped sub-scores and their fixed weighted sum
//! 5. blend `weighted * 0.7 + adjusted * 0.3` and clamp to [0, 100]
//! 6. map to a level through the profile's thresholds

use crate::context::RequestContext;
use crate::matcher::RuleMatcher;
use crate::profile::{AdjustmentType, RiskLevel, RiskProfile, ScoringRule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Share of the weighted sub-score sum in the final score.
pub const WEIGHTED_SHARE: f64 = 0.7;

/// Share of the rule-adjusted profile score in the final score.
pub const ADJUSTED_SHARE: f64 = 0.3;

/// Sub-score weights. Profile-independent; they sum to 1.0.
pub const DATA_SENSITIVITY_WEIGHT: f64 = 0.30;
pub const EXPOSURE_WEIGHT: f64 = 0.20;
pub const ACCESS_CONTROL_WEIGHT: f64 = 0.20;
pub const VULNERABILITY_WEIGHT: f64 = 0.15;
pub const COMPLIANCE_WEIGHT: f64 = 0.15;

/// How a factor contributes points.
#[derive(Debug, Clone, Copy)]
enum Contribution {
    /// Fixed points when the factor is active.
    Flag(f64),
    /// Points per unit of a numeric factor (a bare `true` counts as one).
    PerUnit(f64),
}

const DATA_SENSITIVITY: &[(&str, Contribution)] = &[
    ("credentials", Contribution::Flag(40.0)),
    ("secrets", Contribution::Flag(40.0)),
    ("critical_data", Contribution::Flag(40.0)),
    ("pci_data", Contribution::Flag(35.0)),
    ("phi_data", Contribution::Flag(35.0)),
    ("pii_detected", Contribution::Flag(25.0)),
    ("financial_data", Contribution::Flag(25.0)),
    ("health_data", Contribution::Flag(25.0)),
    ("biometric_data", Contribution::Flag(25.0)),
    ("personal_data", Contribution::Flag(15.0)),
    ("internal_data", Contribution::Flag(10.0)),
    ("public_data", Contribution::Flag(2.0)),
];

const EXPOSURE: &[(&str, Contribution)] = &[
    ("public_endpoint", Contribution::Flag(30.0)),
    ("anonymous_access", Contribution::Flag(25.0)),
    ("internet_facing", Contribution::Flag(25.0)),
    ("external_access", Contribution::Flag(25.0)),
    ("third_party_sharing", Contribution::Flag(20.0)),
    ("unencrypted_transport", Contribution::Flag(20.0)),
    ("cross_region", Contribution::Flag(10.0)),
];

/// Subtracted from 100: each control in place lowers access-control risk.
const ACCESS_CONTROLS: &[(&str, Contribution)] = &[
    ("authenticated", Contribution::Flag(30.0)),
    ("mfa_enabled", Contribution::Flag(20.0)),
    ("rbac_enforced", Contribution::Flag(15.0)),
    ("encryption_at_rest", Contribution::Flag(15.0)),
    ("audit_logging", Contribution::Flag(10.0)),
    ("rate_limited", Contribution::Flag(10.0)),
];

const VULNERABILITIES: &[(&str, Contribution)] = &[
    ("injection_detected", Contribution::Flag(40.0)),
    ("malicious_ip", Contribution::Flag(35.0)),
    ("suspicious_payload", Contribution::Flag(25.0)),
    ("outdated_dependencies", Contribution::Flag(20.0)),
    ("misconfiguration", Contribution::Flag(20.0)),
    ("known_vulnerabilities", Contribution::PerUnit(15.0)),
    ("ip_reputation", Contribution::PerUnit(0.3)),
];

const COMPLIANCE: &[(&str, Contribution)] = &[
    ("compliance_violations", Contribution::PerUnit(20.0)),
    ("missing_consent", Contribution::Flag(25.0)),
    ("retention_exceeded", Contribution::Flag(20.0)),
    ("cross_border_transfer", Contribution::Flag(15.0)),
    ("unclassified_data", Contribution::Flag(10.0)),
];

/// Data-class factors used for profile selection, most severe class first.
const DATA_CLASSES: &[(RiskLevel, &[&str])] = &[
    (
        RiskLevel::Critical,
        &["credentials", "secrets", "pci_data", "phi_data", "critical_data"],
    ),
    (
        RiskLevel::High,
        &["pii_detected", "financial_data", "health_data", "biometric_data"],
    ),
    (RiskLevel::Medium, &["personal_data", "internal_data"]),
    (RiskLevel::Low, &["public_data"]),
];

/// The five sub-scores, each in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub data_sensitivity: f64,
    pub exposure: f64,
    pub access_controls: f64,
    pub vulnerabilities: f64,
    pub compliance: f64,
}

impl SubScores {
    pub fn weighted(&self) -> f64 {
        self.data_sensitivity * DATA_SENSITIVITY_WEIGHT
            + self.exposure * EXPOSURE_WEIGHT
            + self.access_controls * ACCESS_CONTROL_WEIGHT
            + self.vulnerabilities * VULNERABILITY_WEIGHT
            + self.compliance * COMPLIANCE_WEIGHT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAdjustment {
    pub rule_id: String,
    pub rule_name: String,
    pub adjustment_type: AdjustmentType,
    pub value: f64,
    pub delta: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedMultiplier {
    pub factor: String,
    pub multiplier: f64,
    pub delta: f64,
}

/// Every intermediate value of one scoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base_score: f64,
    pub adjustments: Vec<AppliedAdjustment>,
    pub multipliers: Vec<AppliedMultiplier>,
    /// Score after rule adjustments and multipliers.
    pub adjusted_score: f64,
    pub sub_scores: SubScores,
    pub weighted_score: f64,
    /// Blend before clamping.
    pub blended_score: f64,
}

/// Output of one scoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub id: String,
    pub request_id: String,
    /// Final score in [0, 100].
    pub score: f64,
    pub level: RiskLevel,
    pub profile_used: String,
    pub applied_rules: Vec<String>,
    pub breakdown: ScoreBreakdown,
    pub assessed_at: DateTime<Utc>,
}

/// Stateless scoring pipeline.
#[derive(Debug, Default)]
pub struct ScoringEngine {
    matcher: RuleMatcher,
}

impl ScoringEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matcher(&self) -> &RuleMatcher {
        &self.matcher
    }

    /// Picks the profile for the most severe data class present, falling
    /// back to the default profile, then to any medium profile.
    pub fn select_profile(
        ctx: &RequestContext,
        profiles: &[Arc<RiskProfile>],
    ) -> Option<Arc<RiskProfile>> {
        let by_category = |level: RiskLevel| profiles.iter().find(|p| p.category == level).cloned();

        detect_data_class(ctx)
            .and_then(by_category)
            .or_else(|| profiles.iter().find(|p| p.is_default).cloned())
            .or_else(|| by_category(RiskLevel::Medium))
            .or_else(|| profiles.first().cloned())
    }

    /// Scores `ctx` under `profile` with the given scoring rules.
    pub fn score(
        &self,
        ctx: &RequestContext,
        profile: &RiskProfile,
        rules: &[Arc<ScoringRule>],
    ) -> RiskAssessment {
        let mut current = profile.base_score;

        let mut ordered: Vec<&ScoringRule> = rules.iter().map(|r| &**r).filter(|r| r.enabled).collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut adjustments = Vec::new();
        for rule in ordered {
            if !self.matcher.match_conditions(&rule.conditions, ctx).matched {
                continue;
            }
            let adjustment = &rule.adjustment;
            match adjustment.adjustment_type.apply(current, adjustment.value) {
                Some(next) if next.is_finite() => {
                    adjustments.push(AppliedAdjustment {
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        adjustment_type: adjustment.adjustment_type,
                        value: adjustment.value,
                        delta: next - current,
                        reason: adjustment.reason.clone(),
                    });
                    current = next;
                }
                _ => {
                    tracing::warn!(
                        rule_id = %rule.id,
                        adjustment = ?adjustment.adjustment_type,
                        value = adjustment.value,
                        "Score adjustment skipped"
                    );
                }
            }
        }

        // Multiplication commutes, so walking the profile's table gives the
        // same product as walking the context's factors.
        let mut multipliers = Vec::new();
        for (factor, multiplier) in &profile.multipliers {
            if ctx.factor_active(factor) {
                let next = current * multiplier;
                multipliers.push(AppliedMultiplier {
                    factor: factor.clone(),
                    multiplier: *multiplier,
                    delta: next - current,
                });
                current = next;
            }
        }

        let sub_scores = compute_sub_scores(ctx);
        let weighted_score = sub_scores.weighted();
        let blended_score = weighted_score * WEIGHTED_SHARE + current * ADJUSTED_SHARE;
        let score = clamp_score(blended_score);
        let level = profile.thresholds.level_for(score);

        tracing::debug!(
            request_id = %ctx.request_id,
            profile = %profile.id,
            adjusted = current,
            weighted = weighted_score,
            score,
            level = level.as_str(),
            "Risk scored"
        );

        RiskAssessment {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: ctx.request_id.clone(),
            score,
            level,
            profile_used: profile.id.clone(),
            applied_rules: adjustments.iter().map(|a| a.rule_id.clone()).collect(),
            breakdown: ScoreBreakdown {
                base_score: profile.base_score,
                adjustments,
                multipliers,
                adjusted_score: current,
                sub_scores,
                weighted_score,
                blended_score,
            },
            assessed_at: ctx.timestamp,
        }
    }
}

/// Most severe data class with an active factor in the context.
pub fn detect_data_class(ctx: &RequestContext) -> Option<RiskLevel> {
    DATA_CLASSES
        .iter()
        .find(|(_, factors)| factors.iter().any(|f| ctx.factor_active(f)))
        .map(|(level, _)| *level)
}

/// Computes the five sub-scores from the context's factors.
pub fn compute_sub_scores(ctx: &RequestContext) -> SubScores {
    SubScores {
        data_sensitivity: cap(table_points(ctx, DATA_SENSITIVITY)),
        exposure: cap(table_points(ctx, EXPOSURE)),
        access_controls: cap(100.0 - table_points(ctx, ACCESS_CONTROLS)),
        vulnerabilities: cap(table_points(ctx, VULNERABILITIES)),
        compliance: cap(table_points(ctx, COMPLIANCE)),
    }
}

fn table_points(ctx: &RequestContext, table: &[(&str, Contribution)]) -> f64 {
    table
        .iter()
        .map(|(factor, contribution)| match contribution {
            Contribution::Flag(points) if ctx.factor_active(factor) => *points,
            Contribution::PerUnit(points) => match ctx.factor_number(factor) {
                Some(units) if units > 0.0 => units * points,
                _ if ctx.factor_active(factor) => *points,
                _ => 0.0,
            },
            Contribution::Flag(_) => 0.0,
        })
        .sum()
}

fn cap(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// Clamps to [0, 100]. Infinities saturate to the matching bound; NaN maps
/// to 0.
pub fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}
