//! Action dispatch.
//!
//! After a decision is resolved, every enabled action of every fired rule
//! becomes a typed event published to its topic. Dispatch is best effort:
//! invalid parameters skip the action, publish failures are logged, and
//! nothing here can change the decision.

use crate::audit;
use crate::config::TopicConfig;
use crate::context::RequestContext;
use crate::decision::{Decision, MatchedRule};
use crate::error::{EngineError, Result};
use crate::fingerprint;
use crate::types::{Action, ActionType};
use crate::value::Value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Window applied to rate limits that do not name one.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Destination for engine events.
#[async_trait]
pub trait EventPublisher: Send + Sync + Debug {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()>;
}

/// An event captured by [`InMemoryEventBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Publisher that keeps events in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    events: Mutex<Vec<PublishedEvent>>,
    failing_topics: Mutex<HashSet<String>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes publishes to `topic` fail.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.failing_topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(topic.into());
    }

    pub fn events(&self) -> Vec<PublishedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn events_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.events()
            .into_iter()
            .filter(|event| event.topic == topic)
            .map(|event| event.payload)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        let failing = self
            .failing_topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(topic);
        if failing {
            return Err(EngineError::Publish {
                topic: topic.to_string(),
                message: "topic rejected the event".to_string(),
            });
        }
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(PublishedEvent {
                topic: topic.to_string(),
                payload,
            });
        Ok(())
    }
}

/// Publisher that writes events to the `decision_engine::events` target.
#[derive(Debug, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        tracing::info!(
            target: "decision_engine::events",
            topic = %topic,
            payload = %payload,
            "Event published"
        );
        Ok(())
    }
}

/// Action-specific part of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionPayload {
    Block {
        reason: String,
    },
    Alert {
        severity: String,
        message: String,
    },
    Log {
        level: String,
        message: String,
    },
    Notify {
        channel: String,
        message: String,
    },
    Quarantine {
        reason: String,
        duration_secs: Option<u64>,
    },
    RateLimit {
        limit: f64,
        window_secs: u64,
    },
    Throttle {
        limit: f64,
        window_secs: u64,
    },
    Redirect {
        url: String,
        status: u16,
    },
    UpdateRule {
        target_rule: Option<String>,
        parameters: BTreeMap<String, Value>,
    },
}

impl ActionPayload {
    /// Builds and validates the payload. `Ok(None)` for action types that
    /// have no side effect.
    pub fn from_action(action: &Action, rule: &MatchedRule) -> std::result::Result<Option<Self>, String> {
        let text = |key: &str| action.parameter(key).and_then(|v| v.as_text()).map(|t| t.into_owned());
        let text_or = |key: &str, fallback: &str| text(key).unwrap_or_else(|| fallback.to_string());
        let message = text_or("message", &format!("rule '{}' matched", rule.rule_name));

        let payload = match action.action_type {
            ActionType::Allow => return Ok(None),
            ActionType::Block => ActionPayload::Block {
                reason: text_or("reason", &rule.rule_name),
            },
            ActionType::Alert => ActionPayload::Alert {
                severity: text_or("severity", "medium"),
                message,
            },
            ActionType::Log => ActionPayload::Log {
                level: text_or("level", "info"),
                message,
            },
            ActionType::Notify => ActionPayload::Notify {
                channel: text("channel")
                    .filter(|c| !c.trim().is_empty())
                    .ok_or("notify requires a 'channel' parameter")?,
                message,
            },
            ActionType::Quarantine => ActionPayload::Quarantine {
                reason: text_or("reason", &rule.rule_name),
                duration_secs: positive(action, "duration_secs").map(|d| d as u64),
            },
            ActionType::RateLimit | ActionType::Throttle => {
                let limit = positive(action, "limit")
                    .ok_or("rate limits require a positive 'limit' parameter")?;
                let window_secs = match action.parameter("window_secs") {
                    None => DEFAULT_WINDOW_SECS,
                    Some(_) => positive(action, "window_secs")
                        .ok_or("'window_secs' must be a positive number")?
                        as u64,
                };
                if action.action_type == ActionType::Throttle {
                    ActionPayload::Throttle { limit, window_secs }
                } else {
                    ActionPayload::RateLimit { limit, window_secs }
                }
            }
            ActionType::Redirect => {
                let url = text("url")
                    .filter(|u| !u.trim().is_empty())
                    .ok_or("redirect requires a 'url' parameter")?;
                let status = match action.parameter("status").and_then(Value::as_f64) {
                    None => 302,
                    Some(code) if (300.0..400.0).contains(&code) => code as u16,
                    Some(code) => return Err(format!("redirect status {} is not a 3xx code", code)),
                };
                ActionPayload::Redirect { url, status }
            }
            ActionType::UpdateRule => ActionPayload::UpdateRule {
                target_rule: text("rule_id"),
                parameters: action.parameters.clone(),
            },
        };
        Ok(Some(payload))
    }
}

fn positive(action: &Action, key: &str) -> Option<f64> {
    action
        .parameter(key)
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite() && *n > 0.0)
}

/// Topic an action type publishes to. `None` for side-effect free types.
pub fn topic_for(action_type: ActionType, topics: &TopicConfig) -> Option<&str> {
    let topic = match action_type {
        ActionType::Allow => return None,
        ActionType::Block => &topics.block_requests,
        ActionType::Alert => &topics.security_alerts,
        ActionType::Log => &topics.audit_log,
        ActionType::Notify => &topics.notifications,
        ActionType::Quarantine => &topics.quarantine,
        ActionType::RateLimit | ActionType::Throttle => &topics.rate_limits,
        ActionType::Redirect => &topics.redirects,
        ActionType::UpdateRule => &topics.rule_updates,
    };
    Some(topic.as_str())
}

/// Envelope shared by every action event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub event_id: String,
    /// Same value on every redelivery of this action for this request.
    pub idempotency_key: String,
    pub request_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub verdict: String,
    pub allow: bool,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub payload: ActionPayload,
}

impl ActionEvent {
    pub fn new(
        decision: &Decision,
        rule: &MatchedRule,
        action_type: ActionType,
        payload: ActionPayload,
        ctx: &RequestContext,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            idempotency_key: fingerprint::idempotency_key(
                &decision.request_id,
                &rule.rule_id,
                action_type.as_str(),
            ),
            request_id: decision.request_id.clone(),
            rule_id: rule.rule_id.clone(),
            rule_name: rule.rule_name.clone(),
            verdict: decision.verdict.clone(),
            allow: decision.allow,
            timestamp: decision.timestamp,
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            client_ip: ctx.client_ip.clone(),
            user_id: ctx.user_id.clone(),
            payload,
        }
    }
}

/// Tally of one dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Publishes the side effects of a decision.
#[derive(Debug)]
pub struct ActionExecutor {
    publisher: Arc<dyn EventPublisher>,
    topics: TopicConfig,
    timeout: Duration,
}

impl ActionExecutor {
    pub fn new(publisher: Arc<dyn EventPublisher>, topics: TopicConfig, timeout: Duration) -> Self {
        Self {
            publisher,
            topics,
            timeout,
        }
    }

    pub fn topics(&self) -> &TopicConfig {
        &self.topics
    }

    /// Dispatches every action of every fired rule and waits for the
    /// publishes to settle.
    pub async fn execute(&self, decision: &Decision, ctx: &RequestContext) -> DispatchReport {
        let mut report = DispatchReport::default();

        for rule in &decision.matched_rules {
            for action in &rule.actions {
                if !action.enabled {
                    report.skipped += 1;
                    continue;
                }
                if action.action_type == ActionType::Block && decision.allow {
                    tracing::debug!(
                        request_id = %decision.request_id,
                        rule_id = %rule.rule_id,
                        "Block action not dispatched; decision allows the request"
                    );
                    report.skipped += 1;
                    continue;
                }
                let Some(topic) = topic_for(action.action_type, &self.topics) else {
                    report.skipped += 1;
                    continue;
                };
                let payload = match ActionPayload::from_action(action, rule) {
                    Ok(Some(payload)) => payload,
                    Ok(None) => {
                        report.skipped += 1;
                        continue;
                    }
                    Err(problem) => {
                        tracing::warn!(
                            request_id = %decision.request_id,
                            rule_id = %rule.rule_id,
                            action = action.action_type.as_str(),
                            problem = %problem,
                            "Action skipped: invalid parameters"
                        );
                        report.skipped += 1;
                        continue;
                    }
                };

                let event = ActionEvent::new(decision, rule, action.action_type, payload, ctx);
                let key = event.idempotency_key.clone();
                let outcome = match serde_json::to_value(&event) {
                    Ok(json) => self.publish(topic, json).await,
                    Err(err) => Err(err.into()),
                };
                match outcome {
                    Ok(()) => {
                        audit::emit_action(
                            &decision.request_id,
                            &rule.rule_id,
                            action.action_type.as_str(),
                            topic,
                            &key,
                        );
                        report.dispatched += 1;
                    }
                    Err(err) => {
                        tracing::warn!(
                            request_id = %decision.request_id,
                            rule_id = %rule.rule_id,
                            topic = %topic,
                            error = %err,
                            "Action dispatch failed"
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        tracing::debug!(
            request_id = %decision.request_id,
            dispatched = report.dispatched,
            skipped = report.skipped,
            failed = report.failed,
            "Actions dispatched"
        );
        report
    }

    /// Publishes one event under the configured deadline.
    pub async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, self.publisher.publish(topic, payload)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                operation: format!("publish to {}", topic),
                elapsed: started.elapsed(),
            }),
        }
    }

    /// Serializes and publishes, logging instead of failing.
    pub async fn publish_record<T: Serialize>(&self, topic: &str, record: &T) -> bool {
        let outcome = match serde_json::to_value(record) {
            Ok(json) => self.publish(topic, json).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = outcome {
            tracing::warn!(topic = %topic, error = %err, "Publish failed");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DecisionLevel, Vocabulary};

    fn matched(rule_id: &str, actions: Vec<Action>) -> MatchedRule {
        MatchedRule {
            rule_id: rule_id.to_string(),
            rule_name: rule_id.to_string(),
            priority: 50,
            matched_conditions: Vec::new(),
            actions,
            confidence: 1.0,
        }
    }

    fn decision(allow: bool, rules: Vec<MatchedRule>) -> Decision {
        Decision {
            allow,
            level: if allow { DecisionLevel::Allow } else { DecisionLevel::Deny },
            verdict: if allow { "allow" } else { "deny" }.to_string(),
            reason: "test".to_string(),
            matched_rules: rules,
            ..Decision::no_match("req-1", Vocabulary::Access, 1, Utc::now())
        }
    }

    fn executor(bus: Arc<InMemoryEventBus>) -> ActionExecutor {
        ActionExecutor::new(bus, TopicConfig::default(), Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_block_and_alert_dispatched() {
        let bus = Arc::new(InMemoryEventBus::new());
        let rule = matched("r1", vec![Action::block(), Action::new(ActionType::Alert)]);
        let report = executor(bus.clone())
            .execute(&decision(false, vec![rule]), &RequestContext::new("GET", "/"))
            .await;

        assert_eq!(report.dispatched, 2);
        let blocks = bus.events_on("block-requests");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["action"], "block");
        assert_eq!(blocks[0]["rule_id"], "r1");
        assert_eq!(
            blocks[0]["idempotency_key"],
            fingerprint::idempotency_key("req-1", "r1", "block")
        );
        assert_eq!(bus.events_on("security-alerts").len(), 1);
    }

    #[tokio::test]
    async fn test_block_skipped_when_allowed() {
        let bus = Arc::new(InMemoryEventBus::new());
        let rule = matched("r1", vec![Action::block(), Action::allow()]);
        let report = executor(bus.clone())
            .execute(&decision(true, vec![rule]), &RequestContext::new("GET", "/"))
            .await;
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.skipped, 2);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_parameters_skip_action() {
        let bus = Arc::new(InMemoryEventBus::new());
        let rule = matched(
            "r1",
            vec![
                Action::new(ActionType::RateLimit).with_parameter("limit", 0.0),
                Action::new(ActionType::Redirect),
                Action::new(ActionType::Notify).with_parameter("channel", "#secops"),
                Action::new(ActionType::Throttle)
                    .with_parameter("limit", 10.0)
                    .with_parameter("window_secs", 30.0),
            ],
        );
        let report = executor(bus.clone())
            .execute(&decision(true, vec![rule]), &RequestContext::new("GET", "/"))
            .await;
        assert_eq!(report.skipped, 2);
        assert_eq!(report.dispatched, 2);
        let limits = bus.events_on("rate-limits");
        assert_eq!(limits[0]["action"], "throttle");
        assert_eq!(limits[0]["window_secs"], 30);
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted_not_raised() {
        let bus = Arc::new(InMemoryEventBus::new());
        bus.fail_topic("security-alerts");
        let rule = matched("r1", vec![Action::new(ActionType::Alert), Action::new(ActionType::Log)]);
        let report = executor(bus.clone())
            .execute(&decision(true, vec![rule]), &RequestContext::new("GET", "/"))
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(bus.events_on("audit-log").len(), 1);
    }

    #[test]
    fn test_topic_mapping() {
        let topics = TopicConfig::default();
        assert_eq!(topic_for(ActionType::Block, &topics), Some("block-requests"));
        assert_eq!(topic_for(ActionType::Quarantine, &topics), Some("quarantine"));
        assert_eq!(topic_for(ActionType::Allow, &topics), None);
    }
}
