//! Risk profiles and scoring rules.

use crate::error::{EngineError, Result};
use crate::types::Condition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Discrete risk level. Also used as a profile's category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Level boundaries. Must be strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Thresholds {
    /// Maps a score to its level: `>= critical`, else `>= high`, else
    /// `>= medium`, else low.
    pub fn level_for(&self, score: f64) -> RiskLevel {
        if score >= self.critical {
            RiskLevel::Critical
        } else if score >= self.high {
            RiskLevel::High
        } else if score >= self.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn is_strictly_increasing(&self) -> bool {
        self.low < self.medium && self.medium < self.high && self.high < self.critical
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low: 20.0,
            medium: 40.0,
            high: 60.0,
            critical: 80.0,
        }
    }
}

/// Baseline score, multiplier table and level thresholds for one class of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Data class this profile is selected for.
    pub category: RiskLevel,
    pub base_score: f64,
    /// Factor name to multiplier, applied when the factor is active.
    #[serde(default)]
    pub multipliers: BTreeMap<String, f64>,
    #[serde(default)]
    pub thresholds: Thresholds,
    /// Fallback profile when no data class is detected.
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

impl RiskProfile {
    pub fn new(id: impl Into<String>, category: RiskLevel, base_score: f64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            category,
            base_score,
            multipliers: BTreeMap::new(),
            thresholds: Thresholds::default(),
            is_default: false,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    pub fn with_multiplier(mut self, factor: impl Into<String>, multiplier: f64) -> Self {
        self.multipliers.insert(factor.into(), multiplier);
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();
        if self.id.trim().is_empty() {
            issues.push("profile id is required".to_string());
        }
        if self.name.trim().is_empty() {
            issues.push("profile name is required".to_string());
        }
        if !(0.0..=100.0).contains(&self.base_score) {
            issues.push(format!("profile '{}' base score must be in [0, 100]", self.id));
        }
        if !self.thresholds.is_strictly_increasing() {
            issues.push(format!("profile '{}' thresholds must be strictly increasing", self.id));
        }
        for (factor, multiplier) in &self.multipliers {
            if !multiplier.is_finite() || *multiplier < 0.0 {
                issues.push(format!(
                    "profile '{}' multiplier '{}' must be a non-negative number",
                    self.id, factor
                ));
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(issues))
        }
    }

    /// One profile per category; medium is the default.
    pub fn standard_set() -> Vec<RiskProfile> {
        vec![
            RiskProfile::new("critical-data", RiskLevel::Critical, 70.0)
                .with_multiplier("external_access", 1.3)
                .with_multiplier("unencrypted_transport", 1.5)
                .with_thresholds(Thresholds {
                    low: 10.0,
                    medium: 30.0,
                    high: 50.0,
                    critical: 70.0,
                }),
            RiskProfile::new("high-risk-data", RiskLevel::High, 50.0)
                .with_multiplier("pii_detected", 1.2)
                .with_multiplier("external_access", 1.2)
                .with_thresholds(Thresholds {
                    low: 15.0,
                    medium: 35.0,
                    high: 55.0,
                    critical: 75.0,
                }),
            RiskProfile::new("standard", RiskLevel::Medium, 30.0)
                .with_multiplier("external_access", 1.1)
                .as_default(),
            RiskProfile::new("low-risk-data", RiskLevel::Low, 10.0).with_thresholds(Thresholds {
                low: 25.0,
                medium: 50.0,
                high: 75.0,
                critical: 90.0,
            }),
        ]
    }
}

/// How a scoring rule changes the running score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentType {
    /// `current + value`
    Add,
    /// `current - value`
    Subtract,
    /// `current * value`
    Multiply,
    /// `current / value`; skipped when value is 0
    Divide,
    /// `value`, discarding the running score
    Set,
}

impl AdjustmentType {
    /// Applies the adjustment. `None` when it cannot be applied.
    pub fn apply(&self, current: f64, value: f64) -> Option<f64> {
        match self {
            AdjustmentType::Add => Some(current + value),
            AdjustmentType::Subtract => Some(current - value),
            AdjustmentType::Multiply => Some(current * value),
            AdjustmentType::Divide if value == 0.0 => None,
            AdjustmentType::Divide => Some(current / value),
            AdjustmentType::Set => Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreAdjustment {
    #[serde(rename = "type")]
    pub adjustment_type: AdjustmentType,
    pub value: f64,
    #[serde(default)]
    pub reason: String,
}

/// Conditions plus one score adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub adjustment: ScoreAdjustment,
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ScoringRule {
    pub fn new(
        id: impl Into<String>,
        conditions: Vec<Condition>,
        adjustment_type: AdjustmentType,
        value: f64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            priority: 0,
            enabled: true,
            conditions,
            adjustment: ScoreAdjustment {
                adjustment_type,
                value,
                reason: String::new(),
            },
            version: 1,
            updated_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();
        if self.id.trim().is_empty() {
            issues.push("scoring rule id is required".to_string());
        }
        if self.name.trim().is_empty() {
            issues.push("scoring rule name is required".to_string());
        }
        if !(crate::policy::MIN_PRIORITY..=crate::policy::MAX_PRIORITY).contains(&self.priority) {
            issues.push(format!("scoring rule '{}' priority out of range", self.id));
        }
        let value = self.adjustment.value;
        if !value.is_finite() {
            issues.push(format!("scoring rule '{}' adjustment must be finite", self.id));
        }
        if matches!(
            self.adjustment.adjustment_type,
            AdjustmentType::Multiply | AdjustmentType::Divide
        ) && value <= 0.0
        {
            issues.push(format!(
                "scoring rule '{}' multiply/divide value must be positive",
                self.id
            ));
        }
        for condition in &self.conditions {
            issues.extend(condition.validate());
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(issues))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_thresholds() {
        let thresholds = Thresholds::default();
        assert_eq!(thresholds.level_for(85.0), RiskLevel::Critical);
        assert_eq!(thresholds.level_for(80.0), RiskLevel::Critical);
        assert_eq!(thresholds.level_for(60.0), RiskLevel::High);
        assert_eq!(thresholds.level_for(45.0), RiskLevel::Medium);
        assert_eq!(thresholds.level_for(5.0), RiskLevel::Low);
    }

    #[test]
    fn test_thresholds_must_increase() {
        let profile = RiskProfile::new("p", RiskLevel::Medium, 30.0).with_thresholds(Thresholds {
            low: 10.0,
            medium: 10.0,
            high: 50.0,
            critical: 70.0,
        });
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_standard_set_is_valid() {
        let profiles = RiskProfile::standard_set();
        assert!(profiles.iter().all(|p| p.validate().is_ok()));
        assert_eq!(profiles.iter().filter(|p| p.is_default).count(), 1);
    }

    #[test]
    fn test_adjustments() {
        assert_eq!(AdjustmentType::Add.apply(30.0, 5.0), Some(35.0));
        assert_eq!(AdjustmentType::Subtract.apply(30.0, 5.0), Some(25.0));
        assert_eq!(AdjustmentType::Multiply.apply(30.0, 1.5), Some(45.0));
        assert_eq!(AdjustmentType::Divide.apply(30.0, 2.0), Some(15.0));
        assert_eq!(AdjustmentType::Divide.apply(30.0, 0.0), None);
        assert_eq!(AdjustmentType::Set.apply(30.0, 99.0), Some(99.0));
    }

    #[test]
    fn test_scoring_rule_rejects_negative_multiplier() {
        let rule = ScoringRule::new("r", vec![], AdjustmentType::Multiply, -1.0);
        assert!(rule.validate().is_err());
    }
}
