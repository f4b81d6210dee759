//! Rule matching: combines condition results into a rule-level verdict.
//!
//! Conditions are applied strictly left to right. The first condition seeds
//! the running result; each later one is AND-ed (default) or OR-ed into it
//! according to its own `logic_op`. There is no precedence, so
//! `a OR b AND c` means `(a OR b) AND c`. Rule authors relying on OR must
//! order conditions accordingly.

use crate::condition::ConditionEvaluator;
use crate::context::RequestContext;
use crate::policy::Rule;
use crate::types::{Condition, ConditionOperator, LogicOp};
use serde::{Deserialize, Serialize};

/// A condition that contributed a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionMatch {
    pub index: usize,
    pub field: String,
    pub operator: ConditionOperator,
}

/// Result of matching one rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub matched: bool,
    pub matched_conditions: Vec<ConditionMatch>,
    /// Matched condition weight over total weight; 0 when the rule misses.
    pub confidence: f64,
    /// Conditions actually evaluated, after short-circuiting.
    pub evaluated: usize,
}

/// Matches rules against request contexts.
#[derive(Debug, Default)]
pub struct RuleMatcher {
    evaluator: ConditionEvaluator,
}

impl RuleMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluator(&self) -> &ConditionEvaluator {
        &self.evaluator
    }

    /// Matches a rule. Enablement and scope are the caller's concern.
    pub fn match_rule(&self, rule: &Rule, ctx: &RequestContext) -> RuleMatch {
        let result = self.match_conditions(&rule.conditions, ctx);
        tracing::trace!(
            rule_id = %rule.id,
            matched = result.matched,
            evaluated = result.evaluated,
            "Rule matched against context"
        );
        result
    }

    /// Matches an ordered condition list. An empty list matches everything.
    pub fn match_conditions(&self, conditions: &[Condition], ctx: &RequestContext) -> RuleMatch {
        if conditions.is_empty() {
            return RuleMatch {
                matched: true,
                matched_conditions: Vec::new(),
                confidence: 1.0,
                evaluated: 0,
            };
        }

        let last_or = conditions
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, c)| c.logic_op == LogicOp::Or)
            .map(|(i, _)| i)
            .last();

        let mut running: Option<bool> = None;
        let mut matched_conditions = Vec::new();
        let mut matched_weight = 0.0;
        let mut evaluated = 0;

        for (index, condition) in conditions.iter().enumerate() {
            let op = if index == 0 {
                LogicOp::And
            } else {
                condition.logic_op
            };

            match (running, op) {
                (Some(false), LogicOp::And) => {
                    if last_or.map_or(true, |i| i < index) {
                        break;
                    }
                    continue;
                }
                (Some(true), LogicOp::Or) => continue,
                _ => {}
            }

            let resolved = ctx.resolve_field(&condition.field);
            let result = self.evaluator.evaluate(condition, resolved.as_ref());
            evaluated += 1;

            if result.matched {
                matched_weight += result.confidence;
                matched_conditions.push(ConditionMatch {
                    index,
                    field: condition.field.clone(),
                    operator: condition.operator,
                });
            }

            running = Some(match (running, op) {
                (None, _) => result.matched,
                (Some(acc), LogicOp::And) => acc && result.matched,
                (Some(acc), LogicOp::Or) => acc || result.matched,
            });
        }

        let matched = running.unwrap_or(false);
        let total_weight: f64 = conditions.iter().map(|c| c.weight).sum();
        let confidence = if !matched {
            0.0
        } else if total_weight > 0.0 {
            (matched_weight / total_weight).min(1.0)
        } else {
            1.0
        };

        RuleMatch {
            matched,
            matched_conditions,
            confidence,
            evaluated,
        }
    }
}
