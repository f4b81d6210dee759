//! Condition and action types shared by every rule family.

use crate::net::IpRange;
use crate::value::{Value, ValueType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition operator for rule matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    #[serde(alias = "greater_than_or_equal")]
    GreaterEqual,
    #[serde(alias = "less_than_or_equal")]
    LessEqual,
    In,
    NotIn,
    #[serde(alias = "matches")]
    Regex,
    Exists,
    NotExists,
    IpInRange,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "not_equals",
            ConditionOperator::Contains => "contains",
            ConditionOperator::NotContains => "not_contains",
            ConditionOperator::StartsWith => "starts_with",
            ConditionOperator::EndsWith => "ends_with",
            ConditionOperator::GreaterThan => "greater_than",
            ConditionOperator::LessThan => "less_than",
            ConditionOperator::GreaterEqual => "greater_equal",
            ConditionOperator::LessEqual => "less_equal",
            ConditionOperator::In => "in",
            ConditionOperator::NotIn => "not_in",
            ConditionOperator::Regex => "regex",
            ConditionOperator::Exists => "exists",
            ConditionOperator::NotExists => "not_exists",
            ConditionOperator::IpInRange => "ip_in_range",
        }
    }

    /// Operators that look only at presence, never at the value.
    pub fn is_existence(&self) -> bool {
        matches!(self, ConditionOperator::Exists | ConditionOperator::NotExists)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ConditionOperator::GreaterThan
                | ConditionOperator::LessThan
                | ConditionOperator::GreaterEqual
                | ConditionOperator::LessEqual
        )
    }
}

/// How a condition combines with the running result of the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicOp {
    #[default]
    And,
    Or,
}

/// A single field/operator/value test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default = "null_value")]
    pub value: Value,
    #[serde(default, alias = "valueType")]
    pub value_type: ValueType,
    #[serde(default = "default_true", alias = "caseSensitive")]
    pub case_sensitive: bool,
    #[serde(default)]
    pub negate: bool,
    /// Used only for confidence aggregation.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default, alias = "logicOp")]
    pub logic_op: LogicOp,
}

fn null_value() -> Value {
    Value::Null
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

impl Condition {
    /// Creates a case-sensitive, AND-combined condition with weight 1.0.
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
            value_type: ValueType::Auto,
            case_sensitive: true,
            negate: false,
            weight: 1.0,
            logic_op: LogicOp::And,
        }
    }

    /// Creates an `exists` check.
    pub fn exists(field: impl Into<String>) -> Self {
        Self::new(field, ConditionOperator::Exists, Value::Null)
    }

    /// Authoring-time checks. Returns every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if !is_valid_field_name(&self.field) {
            issues.push(format!("invalid field name '{}'", self.field));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            issues.push(format!("condition on '{}' has invalid weight {}", self.field, self.weight));
        }

        match self.operator {
            op if op.is_existence() => {}
            ConditionOperator::Regex => match self.value.as_text() {
                Some(pattern) => {
                    if let Err(err) = Regex::new(&pattern) {
                        issues.push(format!("invalid regex for '{}': {}", self.field, err));
                    }
                }
                None => issues.push(format!("regex condition on '{}' has no pattern", self.field)),
            },
            ConditionOperator::IpInRange => {
                let ranges = self.value.as_list().map(|l| l.into_owned()).unwrap_or_default();
                if ranges.is_empty() {
                    issues.push(format!("ip_in_range on '{}' has no ranges", self.field));
                }
                for range in ranges {
                    if IpRange::parse(&range).is_none() {
                        issues.push(format!("invalid CIDR '{}' on '{}'", range, self.field));
                    }
                }
            }
            op if op.is_numeric() => {
                if self.value.as_f64().is_none() {
                    issues.push(format!(
                        "{} on '{}' needs a numeric value",
                        op.as_str(),
                        self.field
                    ));
                }
            }
            _ => {
                if self.value.is_null() {
                    issues.push(format!(
                        "{} on '{}' needs a value",
                        self.operator.as_str(),
                        self.field
                    ));
                }
            }
        }

        issues
    }
}

/// Field names are identifiers optionally namespaced with dots,
/// e.g. `client_ip`, `header.x-api-key`, `body.user.role`.
pub fn is_valid_field_name(field: &str) -> bool {
    let segment_char = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
    let mut segments = field.split('.');
    let head_ok = segments.next().is_some_and(|head| {
        head.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') && head.chars().all(segment_char)
    });
    head_ok && segments.all(|s| !s.is_empty() && s.chars().all(segment_char))
}

/// Type of side-effecting action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Block,
    Allow,
    Log,
    Alert,
    #[serde(alias = "rateLimit")]
    RateLimit,
    Redirect,
    Throttle,
    Notify,
    Quarantine,
    #[serde(alias = "updateRule")]
    UpdateRule,
}

/// What a matched action does to the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionEffect {
    Deny,
    Warn,
    Allow,
    Neutral,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Block => "block",
            ActionType::Allow => "allow",
            ActionType::Log => "log",
            ActionType::Alert => "alert",
            ActionType::RateLimit => "rate_limit",
            ActionType::Redirect => "redirect",
            ActionType::Throttle => "throttle",
            ActionType::Notify => "notify",
            ActionType::Quarantine => "quarantine",
            ActionType::UpdateRule => "update_rule",
        }
    }

    pub fn effect(&self) -> ActionEffect {
        match self {
            ActionType::Block => ActionEffect::Deny,
            ActionType::Alert | ActionType::Notify | ActionType::Quarantine | ActionType::Redirect => {
                ActionEffect::Warn
            }
            ActionType::Allow => ActionEffect::Allow,
            ActionType::Log | ActionType::Throttle | ActionType::RateLimit | ActionType::UpdateRule => {
                ActionEffect::Neutral
            }
        }
    }
}

/// A directive attached to a rule. Parameters are checked at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Action {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            parameters: BTreeMap::new(),
            enabled: true,
        }
    }

    pub fn block() -> Self {
        Self::new(ActionType::Block)
    }

    pub fn allow() -> Self {
        Self::new(ActionType::Allow)
    }

    /// Adds a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_defaults_from_yaml() {
        let yaml = r#"
field: user_agent
operator: equals
value: mozilla
"#;
        let condition: Condition = serde_yaml::from_str(yaml).unwrap();
        assert!(condition.case_sensitive);
        assert!(!condition.negate);
        assert_eq!(condition.weight, 1.0);
        assert_eq!(condition.logic_op, LogicOp::And);
    }

    #[test]
    fn test_operator_aliases() {
        let op: ConditionOperator = serde_json::from_str(r#""matches""#).unwrap();
        assert_eq!(op, ConditionOperator::Regex);
        let op: ConditionOperator = serde_json::from_str(r#""greater_than_or_equal""#).unwrap();
        assert_eq!(op, ConditionOperator::GreaterEqual);
    }

    #[test]
    fn test_field_names() {
        assert!(is_valid_field_name("client_ip"));
        assert!(is_valid_field_name("header.x-api-key"));
        assert!(is_valid_field_name("body.user.role"));
        assert!(!is_valid_field_name(""));
        assert!(!is_valid_field_name("bad field"));
        assert!(!is_valid_field_name("trailing."));
        assert!(!is_valid_field_name("9lives"));
        assert!(!is_valid_field_name("a..b"));
        assert!(is_valid_field_name("_private.x-1"));
    }

    #[test]
    fn test_condition_validation() {
        let bad_regex = Condition::new("path", ConditionOperator::Regex, "([a-z");
        assert_eq!(bad_regex.validate().len(), 1);

        let bad_cidr = Condition::new("client_ip", ConditionOperator::IpInRange, "10.0.0.0/99");
        assert_eq!(bad_cidr.validate().len(), 1);

        let non_numeric = Condition::new("risk_score", ConditionOperator::GreaterThan, "high");
        assert_eq!(non_numeric.validate().len(), 1);

        assert!(Condition::exists("header.authorization").validate().is_empty());
    }

    #[test]
    fn test_action_effects() {
        assert_eq!(ActionType::Block.effect(), ActionEffect::Deny);
        assert_eq!(ActionType::Alert.effect(), ActionEffect::Warn);
        assert_eq!(ActionType::Throttle.effect(), ActionEffect::Neutral);
        assert_eq!(ActionType::Allow.effect(), ActionEffect::Allow);
    }

    #[test]
    fn test_action_type_alias() {
        let action: Action = serde_json::from_str(r#"{"type": "rateLimit", "parameters": {"limit": 10}}"#).unwrap();
        assert_eq!(action.action_type, ActionType::RateLimit);
        assert_eq!(action.parameter("limit"), Some(&Value::Number(10.0)));
        assert!(action.enabled);
    }
}
