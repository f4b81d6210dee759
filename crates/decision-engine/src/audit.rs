//! Structured audit events.
//!
//! Everything here logs on the `decision_engine::audit` target so operators
//! can route it separately from diagnostics.

use crate::decision::Decision;
use crate::scoring::RiskAssessment;

/// Emits an audit event for a resolved decision.
pub fn emit_decision(decision: &Decision) {
    let rules: Vec<&str> = decision.matched_rule_ids();
    tracing::info!(
        target: "decision_engine::audit",
        event_type = "decision",
        request_id = %decision.request_id,
        allow = decision.allow,
        verdict = %decision.verdict,
        reason = %decision.reason,
        matched_rules = ?rules,
        evaluated_rules = decision.evaluated_rules,
        short_circuited = decision.short_circuited,
        "Decision resolved"
    );
}

/// Emits an audit event for a risk assessment.
pub fn emit_assessment(assessment: &RiskAssessment) {
    tracing::info!(
        target: "decision_engine::audit",
        event_type = "risk_assessment",
        assessment_id = %assessment.id,
        request_id = %assessment.request_id,
        score = assessment.score,
        level = assessment.level.as_str(),
        profile = %assessment.profile_used,
        applied_rules = ?assessment.applied_rules,
        "Risk assessed"
    );
}

/// Emits an audit event for a dispatched action.
pub fn emit_action(request_id: &str, rule_id: &str, action: &str, topic: &str, idempotency_key: &str) {
    tracing::info!(
        target: "decision_engine::audit",
        event_type = "action_dispatched",
        request_id = %request_id,
        rule_id = %rule_id,
        action = %action,
        topic = %topic,
        idempotency_key = %idempotency_key,
        "Action dispatched"
    );
}

/// Emits an audit event for a management change.
pub fn emit_entity_change(kind: &str, id: &str, version: Option<u64>, operation: &str) {
    tracing::info!(
        target: "decision_engine::audit",
        event_type = "entity_change",
        kind = %kind,
        id = %id,
        version = ?version,
        operation = %operation,
        "Managed entity changed"
    );
}
