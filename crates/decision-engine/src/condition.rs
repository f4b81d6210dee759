//! Condition evaluation.
//!
//! Every operator reduces to a boolean. A missing field, a value of the
//! wrong type or an unusable pattern is a non-match, never an error.

use crate::net::IpRange;
use crate::types::{Condition, ConditionOperator};
use crate::value::{Value, ValueType};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Outcome of one condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConditionResult {
    pub matched: bool,
    /// The condition weight when matched, 0 otherwise.
    pub confidence: f64,
}

impl ConditionResult {
    fn from_match(matched: bool, weight: f64) -> Self {
        Self {
            matched,
            confidence: if matched { weight } else { 0.0 },
        }
    }
}

/// Patterns kept before the cache is flushed.
pub const DEFAULT_PATTERN_CAPACITY: usize = 1024;

/// Applies operators to resolved values. Holds the compiled-pattern cache.
#[derive(Debug)]
pub struct ConditionEvaluator {
    /// Keyed by pattern (with case flag). `None` marks a pattern that failed
    /// to compile, so it is reported once and then skipped.
    patterns: RwLock<HashMap<String, Option<Arc<Regex>>>>,
    capacity: usize,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PATTERN_CAPACITY)
    }
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the pattern cache. When full it is flushed, so patterns of
    /// deleted or edited rules do not accumulate.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Evaluates `condition` against the value resolved for its field.
    pub fn evaluate(&self, condition: &Condition, resolved: Option<&Value>) -> ConditionResult {
        let matched = match condition.operator {
            ConditionOperator::Exists => resolved.is_some_and(|v| !v.is_null()),
            ConditionOperator::NotExists => resolved.map_or(true, Value::is_null),
            _ => match resolved {
                Some(actual) if !actual.is_null() => self.compare(condition, actual),
                // Absence is a non-match whatever the operator or negation.
                _ => return ConditionResult::from_match(false, condition.weight),
            },
        };

        ConditionResult::from_match(matched != condition.negate, condition.weight)
    }

    fn compare(&self, condition: &Condition, actual: &Value) -> bool {
        let expected = match condition.value.coerce(condition.value_type) {
            Some(expected) => expected,
            None => {
                tracing::debug!(
                    field = %condition.field,
                    value_type = ?condition.value_type,
                    "Condition value does not coerce to declared type"
                );
                return false;
            }
        };
        let case_sensitive = condition.case_sensitive;
        let numeric = condition.value_type == ValueType::Number;

        match condition.operator {
            ConditionOperator::Equals => {
                any_text(actual, |a| text_equals(a, &expected, case_sensitive, numeric))
            }
            ConditionOperator::NotEquals => {
                !any_text(actual, |a| text_equals(a, &expected, case_sensitive, numeric))
            }
            ConditionOperator::Contains => {
                text_op(actual, &expected, case_sensitive, |a, e| a.contains(e))
            }
            ConditionOperator::NotContains => {
                !text_op(actual, &expected, case_sensitive, |a, e| a.contains(e))
            }
            ConditionOperator::StartsWith => {
                text_op(actual, &expected, case_sensitive, |a, e| a.starts_with(e))
            }
            ConditionOperator::EndsWith => {
                text_op(actual, &expected, case_sensitive, |a, e| a.ends_with(e))
            }
            ConditionOperator::GreaterThan => compare_numbers(actual, &expected, |a, e| a > e),
            ConditionOperator::LessThan => compare_numbers(actual, &expected, |a, e| a < e),
            ConditionOperator::GreaterEqual => compare_numbers(actual, &expected, |a, e| a >= e),
            ConditionOperator::LessEqual => compare_numbers(actual, &expected, |a, e| a <= e),
            ConditionOperator::In => is_member(actual, &expected, case_sensitive),
            ConditionOperator::NotIn => {
                expected.as_list().is_some() && !is_member(actual, &expected, case_sensitive)
            }
            ConditionOperator::Regex => {
                let pattern = match expected.as_text() {
                    Some(pattern) => pattern,
                    None => return false,
                };
                match self.pattern(&pattern, case_sensitive, &condition.field) {
                    Some(regex) => any_text(actual, |a| regex.is_match(a)),
                    None => false,
                }
            }
            ConditionOperator::IpInRange => {
                let ranges: Vec<IpRange> = expected
                    .as_list()
                    .map(|l| l.iter().filter_map(|r| IpRange::parse(r)).collect())
                    .unwrap_or_default();
                any_text(actual, |a| ranges.iter().any(|range| range.contains_str(a)))
            }
            ConditionOperator::Exists | ConditionOperator::NotExists => true,
        }
    }

    /// Returns the compiled pattern, compiling and caching it on first use.
    fn pattern(&self, pattern: &str, case_sensitive: bool, field: &str) -> Option<Arc<Regex>> {
        let key = if case_sensitive {
            pattern.to_string()
        } else {
            format!("(?i){}", pattern)
        };

        if let Some(cached) = self
            .patterns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
        {
            return cached.clone();
        }

        let compiled = match RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
        {
            Ok(regex) => Some(Arc::new(regex)),
            Err(err) => {
                tracing::warn!(
                    field = %field,
                    pattern = %pattern,
                    error = %err,
                    "Invalid regex pattern; condition disabled"
                );
                None
            }
        };

        let mut patterns = self
            .patterns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if patterns.len() >= self.capacity && !patterns.contains_key(&key) {
            tracing::debug!(capacity = self.capacity, "Pattern cache full; flushing");
            patterns.clear();
        }
        patterns.entry(key).or_insert(compiled).clone()
    }

    /// Drops every compiled pattern. Called when the rule set changes.
    pub fn clear_patterns(&self) {
        self.patterns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Number of cached patterns, including invalid ones.
    pub fn cached_patterns(&self) -> usize {
        self.patterns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Applies `test` to the actual value, or to each element of a list.
fn any_text<F>(actual: &Value, test: F) -> bool
where
    F: Fn(&str) -> bool,
{
    match actual {
        Value::List(items) => items.iter().any(|item| test(item)),
        other => other.as_text().map(|t| test(&t)).unwrap_or(false),
    }
}

/// Case folding shared by every textual operator.
fn fold(text: &str) -> String {
    text.to_lowercase()
}

/// Text comparison. Numeric equivalence (`"90.0"` = `90`) applies only when
/// the condition declares a number type.
fn text_equals(actual: &str, expected: &Value, case_sensitive: bool, numeric: bool) -> bool {
    if numeric {
        return match (actual.trim().parse::<f64>(), expected.as_f64()) {
            (Ok(a), Some(e)) => a == e,
            _ => false,
        };
    }
    match expected.as_text() {
        Some(e) if case_sensitive => actual == e,
        Some(e) => fold(actual) == fold(&e),
        None => false,
    }
}

fn text_op<F>(actual: &Value, expected: &Value, case_sensitive: bool, op: F) -> bool
where
    F: Fn(&str, &str) -> bool,
{
    let expected = match expected.as_text() {
        Some(e) if case_sensitive => e.into_owned(),
        Some(e) => fold(&e),
        None => return false,
    };
    any_text(actual, |a| {
        if case_sensitive {
            op(a, &expected)
        } else {
            op(&fold(a), &expected)
        }
    })
}

fn compare_numbers<F>(actual: &Value, expected: &Value, cmp: F) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(e)) => cmp(a, e),
        _ => false,
    }
}

fn is_member(actual: &Value, expected: &Value, case_sensitive: bool) -> bool {
    let members = match expected.as_list() {
        Some(members) => members,
        None => return false,
    };
    any_text(actual, |a| {
        members.iter().any(|m| {
            if case_sensitive {
                m == a
            } else {
                fold(m) == fold(a)
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogicOp;

    fn cond(field: &str, operator: ConditionOperator, value: impl Into<Value>) -> Condition {
        Condition::new(field, operator, value)
    }

    fn eval(condition: &Condition, actual: Option<Value>) -> bool {
        ConditionEvaluator::new()
            .evaluate(condition, actual.as_ref())
            .matched
    }

    #[test]
    fn test_equals_case_insensitive() {
        let mut c = cond("user_agent", ConditionOperator::Equals, "mozilla");
        assert!(!eval(&c, Some(Value::from("Mozilla"))));
        c.case_sensitive = false;
        assert!(eval(&c, Some(Value::from("Mozilla"))));
    }

    #[test]
    fn test_equals_numeric_text() {
        let mut c = cond("risk_score", ConditionOperator::Equals, 90.0);
        assert!(eval(&c, Some(Value::from("90"))));
        assert!(eval(&c, Some(Value::Number(90.0))));
        assert!(!eval(&c, Some(Value::from("90.0"))));
        c.value_type = ValueType::Number;
        assert!(eval(&c, Some(Value::from("90.0"))));
        assert!(!eval(&c, Some(Value::from("ninety"))));
    }

    #[test]
    fn test_equals_compares_text_not_numbers() {
        assert!(!eval(&cond("code", ConditionOperator::Equals, "0012"), Some(Value::from("12"))));
        assert!(!eval(&cond("code", ConditionOperator::Equals, "1e3"), Some(Value::from("1000"))));
        assert!(eval(&cond("code", ConditionOperator::NotEquals, "1.0"), Some(Value::from("1"))));
        assert!(eval(&cond("code", ConditionOperator::Equals, "0012"), Some(Value::from("0012"))));
    }

    #[test]
    fn test_case_folding_is_uniform() {
        let mut eq = cond("user_id", ConditionOperator::Equals, "ÉLODIE");
        let mut member = cond("user_id", ConditionOperator::In, vec!["ÉLODIE"]);
        let mut has = cond("user_id", ConditionOperator::Contains, "ÉLO");
        for c in [&mut eq, &mut member, &mut has] {
            c.case_sensitive = false;
            assert!(eval(c, Some(Value::from("élodie"))), "{:?}", c.operator);
        }
    }

    #[test]
    fn test_contains_is_substring() {
        let c = cond("path", ConditionOperator::Contains, "admin");
        assert!(eval(&c, Some(Value::from("/api/admin/users"))));
        assert!(!eval(&c, Some(Value::from("/api/users"))));
        let not = cond("path", ConditionOperator::NotContains, "admin");
        assert!(eval(&not, Some(Value::from("/api/users"))));
    }

    #[test]
    fn test_prefix_suffix() {
        assert!(eval(
            &cond("path", ConditionOperator::StartsWith, "/api"),
            Some(Value::from("/api/x"))
        ));
        assert!(eval(
            &cond("path", ConditionOperator::EndsWith, ".php"),
            Some(Value::from("/index.php"))
        ));
    }

    #[test]
    fn test_numeric_comparisons() {
        let c = cond("risk_score", ConditionOperator::GreaterThan, 50.0);
        assert!(eval(&c, Some(Value::from("72"))));
        assert!(!eval(&c, Some(Value::Number(50.0))));
        assert!(eval(
            &cond("risk_score", ConditionOperator::GreaterEqual, 50.0),
            Some(Value::Number(50.0))
        ));
        // Non-numeric operand is a non-match, not an error.
        assert!(!eval(&c, Some(Value::from("high"))));
    }

    #[test]
    fn test_membership() {
        let c = cond("client_ip", ConditionOperator::In, vec!["1.2.3.4", "5.6.7.8"]);
        assert!(eval(&c, Some(Value::from("1.2.3.4"))));
        assert!(!eval(&c, Some(Value::from("9.9.9.9"))));
        let not_in = cond("method", ConditionOperator::NotIn, vec!["GET", "HEAD"]);
        assert!(eval(&not_in, Some(Value::from("POST"))));
        let roles = cond("roles", ConditionOperator::In, vec!["admin"]);
        assert!(eval(&roles, Some(Value::from(vec!["user", "admin"]))));
    }

    #[test]
    fn test_regex_cached_once() {
        let evaluator = ConditionEvaluator::new();
        let c = cond("path", ConditionOperator::Regex, r"(?:union|select)\s");
        for _ in 0..3 {
            assert!(evaluator.evaluate(&c, Some(&Value::from("1 union select"))).matched);
        }
        assert_eq!(evaluator.cached_patterns(), 1);
    }

    #[test]
    fn test_pattern_cache_is_bounded() {
        let evaluator = ConditionEvaluator::with_capacity(2);
        for pattern in ["^a", "^b", "^c"] {
            let c = cond("path", ConditionOperator::Regex, pattern);
            evaluator.evaluate(&c, Some(&Value::from("abc")));
        }
        assert_eq!(evaluator.cached_patterns(), 1);
        evaluator.clear_patterns();
        assert_eq!(evaluator.cached_patterns(), 0);
        let c = cond("path", ConditionOperator::Regex, "^a");
        assert!(evaluator.evaluate(&c, Some(&Value::from("abc"))).matched);
    }

    #[test]
    fn test_bad_regex_is_non_match() {
        let evaluator = ConditionEvaluator::new();
        let c = cond("path", ConditionOperator::Regex, "([a-z");
        assert!(!evaluator.evaluate(&c, Some(&Value::from("abc"))).matched);
        assert!(!evaluator.evaluate(&c, Some(&Value::from("abc"))).matched);
        assert_eq!(evaluator.cached_patterns(), 1);
    }

    #[test]
    fn test_existence_ignores_value() {
        assert!(eval(&Condition::exists("header.authorization"), Some(Value::from(""))));
        assert!(!eval(&Condition::exists("header.authorization"), None));
        let c = cond("x", ConditionOperator::NotExists, Value::Null);
        assert!(eval(&c, None));
    }

    #[test]
    fn test_ip_in_range() {
        let c = cond("client_ip", ConditionOperator::IpInRange, vec!["10.0.0.0/8", "192.168.0.0/16"]);
        assert!(eval(&c, Some(Value::from("192.168.4.4"))));
        assert!(!eval(&c, Some(Value::from("8.8.8.8"))));
        assert!(!eval(&c, Some(Value::from("not-an-ip"))));
    }

    #[test]
    fn test_negate_and_missing() {
        let mut c = cond("path", ConditionOperator::Equals, "/x");
        c.negate = true;
        assert!(eval(&c, Some(Value::from("/y"))));
        assert!(!eval(&c, Some(Value::from("/x"))));
        // A missing field stays a non-match even when negated.
        assert!(!eval(&c, None));
    }

    #[test]
    fn test_confidence_is_weight() {
        let mut c = cond("path", ConditionOperator::Equals, "/x");
        c.weight = 2.5;
        c.logic_op = LogicOp::And;
        let evaluator = ConditionEvaluator::new();
        assert_eq!(evaluator.evaluate(&c, Some(&Value::from("/x"))).confidence, 2.5);
        assert_eq!(evaluator.evaluate(&c, Some(&Value::from("/y"))).confidence, 0.0);
    }
}
