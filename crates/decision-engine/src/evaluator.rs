//! Policy resolution: turns a rule snapshot and a context into a Decision.

use crate::context::RequestContext;
use crate::decision::{Decision, DecisionLevel, MatchedRule, Vocabulary};
use crate::matcher::{RuleMatch, RuleMatcher};
use crate::policy::{sort_by_priority, Rule};
use crate::types::{Action, ActionEffect};
use std::sync::Arc;

/// Resolves decisions from prioritized rules.
///
/// Resolution order:
/// 1. keep enabled rules whose scope matches the context
/// 2. sort by priority, highest first; equal priorities keep snapshot order
/// 3. evaluate each rule; the first fired rule carrying an explicit `block`
///    or `allow` fixes the allow/deny verdict, warn-class actions raise the
///    level to warn if it is still allow, everything else is only recorded
/// 4. a fail-fast rule carrying a `block` action stops evaluation
///    immediately, whether or not a higher-priority rule already fixed the
///    verdict
#[derive(Debug, Default)]
pub struct PolicyResolver {
    matcher: RuleMatcher,
    vocabulary: Vocabulary,
}

impl PolicyResolver {
    pub fn new(vocabulary: Vocabulary) -> Self {
        Self {
            matcher: RuleMatcher::new(),
            vocabulary,
        }
    }

    pub fn vocabulary(&self) -> Vocabulary {
        self.vocabulary
    }

    pub fn matcher(&self) -> &RuleMatcher {
        &self.matcher
    }

    /// Returns true if the rule would be considered for this context.
    pub fn is_applicable(rule: &Rule, ctx: &RequestContext) -> bool {
        rule.is_enabled() && rule.scope.matches(ctx)
    }

    /// Resolves a decision for `ctx` against `rules`.
    pub fn resolve(&self, rules: &[Arc<Rule>], ctx: &RequestContext) -> Decision {
        let mut applicable: Vec<&Rule> = rules
            .iter()
            .map(|r| &**r)
            .filter(|r| Self::is_applicable(r, ctx))
            .collect();
        sort_by_priority(&mut applicable);

        let mut state = Resolution::new(self.vocabulary);

        for rule in applicable {
            state.evaluated += 1;
            let result = self.matcher.match_rule(rule, ctx);
            if !result.matched {
                continue;
            }

            tracing::debug!(
                request_id = %ctx.request_id,
                rule_id = %rule.id,
                rule_name = %rule.name,
                priority = rule.priority,
                confidence = result.confidence,
                "Rule matched"
            );

            let blocks = state.apply(rule, result);
            if blocks && rule.fail_fast {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    rule_id = %rule.id,
                    "Fail-fast rule blocked; skipping lower-priority rules"
                );
                state.short_circuited = true;
                break;
            }
        }

        state.finish(ctx)
    }
}

/// Running state of one resolution.
struct Resolution {
    vocabulary: Vocabulary,
    allow: bool,
    level: DecisionLevel,
    verdict_fixed: bool,
    deny_reason: Option<String>,
    warn_reason: Option<String>,
    reasons: Vec<String>,
    matched: Vec<MatchedRule>,
    evaluated: usize,
    short_circuited: bool,
}

impl Resolution {
    fn new(vocabulary: Vocabulary) -> Self {
        Self {
            vocabulary,
            allow: true,
            level: DecisionLevel::Allow,
            verdict_fixed: false,
            deny_reason: None,
            warn_reason: None,
            reasons: Vec::new(),
            matched: Vec::new(),
            evaluated: 0,
            short_circuited: false,
        }
    }

    /// Records a fired rule. Returns true if the rule carries an enabled
    /// block action, independent of whether it decided the verdict.
    fn apply(&mut self, rule: &Rule, result: RuleMatch) -> bool {
        let actions: Vec<Action> = rule.actions.iter().filter(|a| a.enabled).cloned().collect();
        let has = |effect: ActionEffect| actions.iter().any(|a| a.action_type.effect() == effect);
        let (deny, warn, allow) = (
            has(ActionEffect::Deny),
            has(ActionEffect::Warn),
            has(ActionEffect::Allow),
        );

        let mut denied_here = false;
        let label = |level| self.vocabulary.label(level);

        let note = if !self.vocabulary.enforces() {
            format!("{}: {}", rule.name, label(DecisionLevel::Warn))
        } else if deny && !self.verdict_fixed {
            denied_here = true;
            format!("{}: {}", rule.name, label(DecisionLevel::Deny))
        } else if deny {
            format!("{}: deny ignored, verdict fixed by higher priority rule", rule.name)
        } else if allow && !self.verdict_fixed {
            format!("{}: {}", rule.name, label(DecisionLevel::Allow))
        } else if warn {
            format!("{}: {}", rule.name, label(DecisionLevel::Warn))
        } else {
            format!("{}: matched", rule.name)
        };

        if self.vocabulary.enforces() {
            if denied_here {
                self.allow = false;
                self.level = DecisionLevel::Deny;
                self.deny_reason = Some(rule.name.clone());
            }
            if (deny || allow) && !self.verdict_fixed {
                self.verdict_fixed = true;
            }
            if warn && self.level == DecisionLevel::Allow {
                self.level = DecisionLevel::Warn;
                self.warn_reason = Some(rule.name.clone());
            }
        }

        self.reasons.push(note);
        self.matched.push(MatchedRule {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            priority: rule.priority,
            matched_conditions: result.matched_conditions,
            actions,
            confidence: result.confidence,
        });

        deny
    }

    fn finish(self, ctx: &RequestContext) -> Decision {
        if self.matched.is_empty() {
            return Decision::no_match(&ctx.request_id, self.vocabulary, self.evaluated, ctx.timestamp);
        }

        let verdict = match self.vocabulary {
            Vocabulary::Classification => self.vocabulary.label(DecisionLevel::Warn),
            vocabulary => vocabulary.label(self.level),
        }
        .to_string();

        let reason = match self.level {
            DecisionLevel::Deny => self.deny_reason,
            DecisionLevel::Warn => self.warn_reason,
            DecisionLevel::Allow => None,
        }
        .unwrap_or_else(|| {
            let names: Vec<&str> = self.matched.iter().map(|m| m.rule_name.as_str()).collect();
            format!("matched {}", names.join(", "))
        });

        Decision {
            request_id: ctx.request_id.clone(),
            allow: self.allow,
            level: self.level,
            verdict,
            reason,
            reasons: self.reasons,
            matched_rules: self.matched,
            evaluated_rules: self.evaluated,
            short_circuited: self.short_circuited,
            timestamp: ctx.timestamp,
        }
    }
}
