//! Rule definitions, lifecycle status and scope targeting.
//!
//! Policy rules, compliance rules and classification rules share this one
//! shape; only the verdict vocabulary applied to them differs.

use crate::context::RequestContext;
use crate::error::{EngineError, Result};
use crate::net::{ip_in_any, IpRange};
use crate::types::{Action, Condition};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Lowest priority accepted by the management surface.
pub const MIN_PRIORITY: i32 = 0;

/// Highest priority accepted by the management surface.
pub const MAX_PRIORITY: i32 = 100;

/// Lifecycle status of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Draft,
    #[default]
    Active,
    Inactive,
    Archived,
}

/// A named, prioritized set of conditions plus the actions to take on match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier for the rule.
    pub id: String,

    /// Human-readable name, used as the decision reason.
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Higher priority is evaluated first.
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub status: RuleStatus,

    /// Combined left to right; AND unless a condition says OR.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub actions: Vec<Action>,

    /// Stop evaluating lower-priority rules when this one denies.
    #[serde(default, alias = "failFast")]
    pub fail_fast: bool,

    #[serde(default)]
    pub scope: Scope,

    /// Incremented on every update.
    #[serde(default = "default_version")]
    pub version: u64,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u64 {
    1
}

impl Rule {
    /// Creates an enabled, active rule with no conditions or actions.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            priority: 0,
            enabled: true,
            status: RuleStatus::Active,
            conditions: Vec::new(),
            actions: Vec::new(),
            fail_fast: false,
            scope: Scope::default(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validated factory: builds a rule from its parts and rejects it if it
    /// would not pass the management checks.
    pub fn build(
        id: impl Into<String>,
        name: impl Into<String>,
        priority: i32,
        conditions: Vec<Condition>,
        actions: Vec<Action>,
    ) -> Result<Self> {
        let rule = Self {
            priority,
            conditions,
            actions,
            ..Self::new(id, name)
        };
        rule.validate()?;
        Ok(rule)
    }

    /// A rule is considered only when enabled and active.
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.status == RuleStatus::Active
    }

    /// Authoring-time validation. Collects every problem before failing.
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();

        if self.id.trim().is_empty() {
            issues.push("rule id is required".to_string());
        }
        if self.name.trim().is_empty() {
            issues.push("rule name is required".to_string());
        }
        if self.conditions.is_empty() {
            issues.push(format!("rule '{}' needs at least one condition", self.id));
        }
        if self.actions.is_empty() {
            issues.push(format!("rule '{}' needs at least one action", self.id));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            issues.push(format!(
                "rule '{}' priority {} outside [{}, {}]",
                self.id, self.priority, MIN_PRIORITY, MAX_PRIORITY
            ));
        }
        for condition in &self.conditions {
            issues.extend(condition.validate());
        }
        issues.extend(self.scope.validate());

        if issues.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(issues))
        }
    }
}

/// Returns rules sorted by priority, highest first. Ties keep input order.
pub fn sort_by_priority<R: AsRef<Rule>>(rules: &mut [R]) {
    // `sort_by` is stable, which keeps insertion order among equal priorities.
    rules.sort_by(|a, b| b.as_ref().priority.cmp(&a.as_ref().priority));
}

impl AsRef<Rule> for Rule {
    fn as_ref(&self) -> &Rule {
        self
    }
}

/// Targeting filter restricting which requests a rule is considered for.
///
/// Each non-empty list must match; an empty list matches everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub apis: Vec<String>,

    /// Exact paths, or prefixes ending in `*`.
    #[serde(default)]
    pub endpoints: Vec<String>,

    #[serde(default)]
    pub users: Vec<String>,

    #[serde(default)]
    pub roles: Vec<String>,

    /// CIDR ranges or single addresses.
    #[serde(default)]
    pub ip_ranges: Vec<String>,

    #[serde(default)]
    pub time_windows: Vec<TimeWindow>,
}

impl Scope {
    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
            && self.endpoints.is_empty()
            && self.users.is_empty()
            && self.roles.is_empty()
            && self.ip_ranges.is_empty()
            && self.time_windows.is_empty()
    }

    /// Returns true if the context falls inside this scope.
    pub fn matches(&self, ctx: &RequestContext) -> bool {
        if !self.apis.is_empty() {
            match &ctx.api_id {
                Some(api) if self.apis.iter().any(|a| a == api) => {}
                _ => return false,
            }
        }

        if !self.endpoints.is_empty() {
            let endpoint = ctx.endpoint.as_deref().unwrap_or(ctx.path.as_str());
            if !self.endpoints.iter().any(|e| endpoint_matches(e, endpoint)) {
                return false;
            }
        }

        if !self.users.is_empty() {
            match &ctx.user_id {
                Some(user) if self.users.iter().any(|u| u == user) => {}
                _ => return false,
            }
        }

        if !self.roles.is_empty() && !ctx.roles.iter().any(|r| self.roles.contains(r)) {
            return false;
        }

        if !self.ip_ranges.is_empty() {
            match &ctx.client_ip {
                Some(ip) if ip_in_any(ip, &self.ip_ranges) => {}
                _ => return false,
            }
        }

        if !self.time_windows.is_empty()
            && !self.time_windows.iter().any(|w| w.contains(&ctx.timestamp))
        {
            return false;
        }

        true
    }

    fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for range in &self.ip_ranges {
            if IpRange::parse(range).is_none() {
                issues.push(format!("invalid scope ip range '{}'", range));
            }
        }
        for window in &self.time_windows {
            if window.start_hour > 23 || window.end_hour > 24 {
                issues.push(format!(
                    "invalid time window {}-{}",
                    window.start_hour, window.end_hour
                ));
            }
            if window.days.iter().any(|d| *d > 6) {
                issues.push("time window days must be 0 (Monday) to 6 (Sunday)".to_string());
            }
        }
        issues
    }
}

fn endpoint_matches(pattern: &str, endpoint: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => endpoint.starts_with(prefix),
        None => pattern == endpoint,
    }
}

/// An hour range in UTC, optionally restricted to weekdays.
///
/// `start_hour` is inclusive and `end_hour` exclusive; a window whose end is
/// before its start wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    /// 0 = Monday .. 6 = Sunday. Empty means every day.
    #[serde(default)]
    pub days: Vec<u32>,
}

impl TimeWindow {
    pub fn contains(&self, at: &DateTime<Utc>) -> bool {
        if !self.days.is_empty() && !self.days.contains(&at.weekday().num_days_from_monday()) {
            return false;
        }
        let hour = at.hour();
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionType, ConditionOperator};
    use chrono::TimeZone;

    #[test]
    fn test_rule_from_yaml() {
        let yaml = r#"
id: block-bad-ips
name: Block bad IPs
priority: 90
fail_fast: true
conditions:
  - field: client_ip
    operator: in
    value: ["1.2.3.4"]
actions:
  - type: block
"#;
        let rule: Rule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.priority, 90);
        assert!(rule.fail_fast);
        assert!(rule.is_enabled());
        assert_eq!(rule.version, 1);
        assert!(rule.scope.is_empty());
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_validation_collects_issues() {
        let mut rule = Rule::new("", "");
        rule.priority = 150;
        let err = rule.validate().unwrap_err();
        match err {
            EngineError::Validation(issues) => assert_eq!(issues.len(), 5),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_factory() {
        let rule = Rule::build(
            "r1",
            "Rule one",
            50,
            vec![Condition::new("path", ConditionOperator::Equals, "/x")],
            vec![Action::new(ActionType::Log)],
        )
        .unwrap();
        assert_eq!(rule.priority, 50);

        let err = Rule::build("r2", "Rule two", 50, vec![], vec![]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_status_controls_enabled() {
        let mut rule = Rule::new("r", "r");
        rule.status = RuleStatus::Draft;
        assert!(!rule.is_enabled());
        rule.status = RuleStatus::Active;
        rule.enabled = false;
        assert!(!rule.is_enabled());
    }

    #[test]
    fn test_stable_priority_sort() {
        let mut rules: Vec<Rule> = ["a", "b", "c", "d"]
            .iter()
            .zip([10, 50, 10, 50])
            .map(|(id, p)| Rule {
                priority: p,
                ..Rule::new(*id, *id)
            })
            .collect();
        sort_by_priority(&mut rules);
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_scope_matching() {
        let scope = Scope {
            endpoints: vec!["/admin/*".to_string()],
            roles: vec!["operator".to_string()],
            ip_ranges: vec!["10.0.0.0/8".to_string()],
            ..Scope::default()
        };
        let ctx = RequestContext::new("GET", "/admin/users")
            .with_role("operator")
            .with_client_ip("10.9.9.9");
        assert!(scope.matches(&ctx));

        let outside = ctx.clone().with_client_ip("192.168.1.1");
        assert!(!scope.matches(&outside));

        let no_role = RequestContext::new("GET", "/admin/users").with_client_ip("10.9.9.9");
        assert!(!scope.matches(&no_role));

        assert!(Scope::default().matches(&RequestContext::new("GET", "/")));
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let window = TimeWindow {
            start_hour: 22,
            end_hour: 6,
            days: vec![],
        };
        assert!(window.contains(&Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap()));
        assert!(window.contains(&Utc.with_ymd_and_hms(2024, 3, 1, 3, 0, 0).unwrap()));
        assert!(!window.contains(&Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_time_window_days() {
        // 2024-03-02 is a Saturday.
        let weekdays = TimeWindow {
            start_hour: 0,
            end_hour: 24,
            days: vec![0, 1, 2, 3, 4],
        };
        assert!(!weekdays.contains(&Utc.with_ymd_and_hms(2024, 3, 2, 10, 0, 0).unwrap()));
        assert!(weekdays.contains(&Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()));
    }
}
