//! Decision types and verdict vocabularies.

use crate::matcher::ConditionMatch;
use crate::types::Action;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of the resolved verdict. Ordered so that `max` never downgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionLevel {
    Allow,
    Warn,
    Deny,
}

impl DecisionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionLevel::Allow => "allow",
            DecisionLevel::Warn => "warn",
            DecisionLevel::Deny => "deny",
        }
    }
}

/// Verdict vocabulary of the service a resolver runs for.
///
/// The matching and resolution logic is shared; only the words and whether
/// a match can refuse the request change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vocabulary {
    /// allow / warn / deny.
    #[default]
    Access,
    /// compliant / warning / violation.
    Compliance,
    /// unlabeled / labeled. Never refuses a request.
    Classification,
}

impl Vocabulary {
    /// Domain word for a level.
    pub fn label(&self, level: DecisionLevel) -> &'static str {
        match (self, level) {
            (Vocabulary::Access, level) => level.as_str(),
            (Vocabulary::Compliance, DecisionLevel::Allow) => "compliant",
            (Vocabulary::Compliance, DecisionLevel::Warn) => "warning",
            (Vocabulary::Compliance, DecisionLevel::Deny) => "violation",
            (Vocabulary::Classification, DecisionLevel::Allow) => "unlabeled",
            (Vocabulary::Classification, _) => "labeled",
        }
    }

    /// Reason used when no rule matched.
    pub fn default_reason(&self) -> &'static str {
        match self {
            Vocabulary::Access => "no applicable policy matched",
            Vocabulary::Compliance => "no compliance rule violated",
            Vocabulary::Classification => "no classification rule matched",
        }
    }

    /// Whether matches can deny or warn. Classification only labels.
    pub fn enforces(&self) -> bool {
        !matches!(self, Vocabulary::Classification)
    }
}

/// A rule that fired during resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRule {
    pub rule_id: String,
    pub rule_name: String,
    pub priority: i32,
    pub matched_conditions: Vec<ConditionMatch>,
    pub actions: Vec<Action>,
    pub confidence: f64,
}

/// The resolved verdict for one context. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub request_id: String,

    pub allow: bool,

    pub level: DecisionLevel,

    /// `level` in the resolver's vocabulary.
    pub verdict: String,

    /// Primary reason: the denying/warning rule name, or the default reason.
    pub reason: String,

    /// One entry per fired rule, in evaluation order.
    pub reasons: Vec<String>,

    pub matched_rules: Vec<MatchedRule>,

    /// Rules whose conditions were evaluated.
    pub evaluated_rules: usize,

    /// True when resolution stopped at a fail-fast rule.
    pub short_circuited: bool,

    /// Taken from the context, not the wall clock, so decisions are repeatable.
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    /// Default decision when nothing matched.
    pub fn no_match(
        request_id: impl Into<String>,
        vocabulary: Vocabulary,
        evaluated_rules: usize,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            allow: true,
            level: DecisionLevel::Allow,
            verdict: vocabulary.label(DecisionLevel::Allow).to_string(),
            reason: vocabulary.default_reason().to_string(),
            reasons: Vec::new(),
            matched_rules: Vec::new(),
            evaluated_rules,
            short_circuited: false,
            timestamp,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allow
    }

    pub fn is_default(&self) -> bool {
        self.matched_rules.is_empty()
    }

    pub fn matched_rule_ids(&self) -> Vec<&str> {
        self.matched_rules.iter().map(|m| m.rule_id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_match_decision() {
        let decision = Decision::no_match("req", Vocabulary::Access, 3, Utc::now());
        assert!(decision.is_allowed());
        assert!(decision.is_default());
        assert_eq!(decision.reason, "no applicable policy matched");
        assert_eq!(decision.verdict, "allow");
    }

    #[test]
    fn test_level_order() {
        assert!(DecisionLevel::Deny > DecisionLevel::Warn);
        assert_eq!(DecisionLevel::Deny.max(DecisionLevel::Warn), DecisionLevel::Deny);
    }

    #[test]
    fn test_vocabulary_labels() {
        assert_eq!(Vocabulary::Compliance.label(DecisionLevel::Deny), "violation");
        assert_eq!(Vocabulary::Classification.label(DecisionLevel::Warn), "labeled");
        assert!(!Vocabulary::Classification.enforces());
    }
}
