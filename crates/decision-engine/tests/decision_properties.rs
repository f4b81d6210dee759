use chrono::{TimeZone, Utc};
use decision_engine::prelude::*;
use decision_engine::condition::ConditionEvaluator;
use decision_engine::scoring::ScoringEngine;
use serde_json::json;
use std::sync::Arc;

fn rule(id: &str, priority: i32, conditions: Vec<Condition>, action: ActionType) -> Rule {
    Rule {
        priority,
        conditions,
        actions: vec![Action::new(action)],
        ..Rule::new(id, id)
    }
}

fn fixed_ctx() -> RequestContext {
    RequestContext::new("GET", "/x")
        .with_request_id("req-42")
        .with_client_ip("1.2.3.4")
        .with_user_agent("Mozilla/5.0")
        .with_timestamp(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap())
}

async fn engine_with(rules: Vec<Rule>) -> DecisionEngine {
    DecisionEngine::builder()
        .with_entities(rules, vec![], vec![])
        .with_publisher(Arc::new(InMemoryEventBus::new()))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_higher_priority_verdict_wins() {
    let same = || vec![Condition::new("path", ConditionOperator::Equals, "/x")];

    let engine = engine_with(vec![
        rule("allow-low", 10, same(), ActionType::Allow),
        rule("block-high", 90, same(), ActionType::Block),
    ])
    .await;
    let decision = engine.evaluate(&fixed_ctx());
    assert!(!decision.allow);
    assert_eq!(decision.matched_rule_ids(), vec!["block-high", "allow-low"]);

    let engine = engine_with(vec![
        rule("block-low", 10, same(), ActionType::Block),
        rule("allow-high", 90, same(), ActionType::Allow),
    ])
    .await;
    assert!(engine.evaluate(&fixed_ctx()).allow);
}

#[tokio::test]
async fn test_resolution_is_deterministic() {
    let engine = engine_with(vec![
        rule(
            "ua",
            50,
            vec![Condition::new("user_agent", ConditionOperator::Contains, "Mozilla")],
            ActionType::Alert,
        ),
        rule(
            "ip",
            50,
            vec![Condition::new("client_ip", ConditionOperator::IpInRange, "1.2.3.0/24")],
            ActionType::Log,
        ),
    ])
    .await;

    let first = engine.evaluate(&fixed_ctx());
    for _ in 0..20 {
        assert_eq!(engine.evaluate(&fixed_ctx()), first);
    }
    assert_eq!(first.matched_rule_ids(), vec!["ua", "ip"]);
}

#[tokio::test]
async fn test_fail_fast_block_example() {
    let mut a = rule(
        "A",
        90,
        vec![Condition::new(
            "client_ip",
            ConditionOperator::In,
            vec!["1.2.3.4"],
        )],
        ActionType::Block,
    );
    a.fail_fast = true;
    let b = rule(
        "B",
        10,
        vec![Condition::new("path", ConditionOperator::Equals, "/x")],
        ActionType::Allow,
    );

    let engine = engine_with(vec![b, a]).await;
    let decision = engine.evaluate(&fixed_ctx());

    assert!(!decision.allow);
    assert_eq!(decision.matched_rule_ids(), vec!["A"]);
    assert_eq!(decision.evaluated_rules, 1);
    assert!(decision.short_circuited);
}

#[tokio::test]
async fn test_fail_fast_block_after_fixed_verdict() {
    let on_x = || vec![Condition::new("path", ConditionOperator::Equals, "/x")];
    for first in [ActionType::Block, ActionType::Allow] {
        let mut stopper = rule("B", 50, on_x(), ActionType::Block);
        stopper.fail_fast = true;
        let engine = engine_with(vec![
            rule("A", 90, on_x(), first),
            stopper,
            rule("C", 10, on_x(), ActionType::Log),
        ])
        .await;

        let decision = engine.evaluate(&fixed_ctx());
        assert_eq!(decision.allow, first == ActionType::Allow);
        assert_eq!(decision.evaluated_rules, 2);
        assert_eq!(decision.matched_rule_ids(), vec!["A", "B"]);
        assert!(decision.short_circuited);
    }
}

#[test]
fn test_equals_on_numeric_looking_strings() {
    let ctx = RequestContext::new("GET", "/")
        .with_parameter("code", "12")
        .with_parameter("one", "1")
        .with_parameter("thousand", "1000");
    let evaluator = ConditionEvaluator::new();
    let check = |condition: serde_json::Value| {
        let condition: Condition = serde_json::from_value(condition).unwrap();
        let resolved = ctx.resolve_field(&condition.field);
        evaluator.evaluate(&condition, resolved.as_ref()).matched
    };

    assert!(!check(json!({"field": "param.code", "operator": "equals", "value": "0012"})));
    assert!(check(json!({"field": "param.one", "operator": "not_equals", "value": "1.0"})));
    assert!(!check(json!({"field": "param.thousand", "operator": "equals", "value": "1e3"})));
    assert!(check(json!({
        "field": "param.thousand",
        "operator": "equals",
        "value": "1e3",
        "valueType": "number"
    })));
}

#[tokio::test]
async fn test_rules_consult_prior_risk_score() {
    let engine = engine_with(vec![rule(
        "risky",
        60,
        vec![Condition::new("risk_score", ConditionOperator::GreaterEqual, 70.0)],
        ActionType::Block,
    )])
    .await;

    let scored = engine.assess(&fixed_ctx());
    let high = fixed_ctx().with_risk_score(scored.score.max(70.0));
    assert!(!engine.evaluate(&high).allow);
    assert!(engine.evaluate(&fixed_ctx().with_risk_score(12.5)).allow);
}

#[tokio::test]
async fn test_no_match_default() {
    let engine = engine_with(vec![rule(
        "never",
        50,
        vec![Condition::new("path", ConditionOperator::Equals, "/nowhere")],
        ActionType::Block,
    )])
    .await;
    let decision = engine.evaluate(&fixed_ctx());
    assert!(decision.allow);
    assert_eq!(decision.reason, "no applicable policy matched");
    assert!(decision.matched_rules.is_empty());
}

#[test]
fn test_equals_case_insensitive_example() {
    let condition: Condition = serde_json::from_value(json!({
        "field": "user_agent",
        "operator": "equals",
        "value": "mozilla",
        "caseSensitive": false
    }))
    .unwrap();
    let ctx = RequestContext::new("GET", "/").with_user_agent("Mozilla");
    let resolved = ctx.resolve_field(&condition.field);
    let result = ConditionEvaluator::new().evaluate(&condition, resolved.as_ref());
    assert!(result.matched);
}

#[test]
fn test_risk_scoring_example() {
    let profile = RiskProfile::new("custom", RiskLevel::Medium, 30.0)
        .with_multiplier("pii_detected", 1.2)
        .with_thresholds(decision_engine::profile::Thresholds {
            low: 5.0,
            medium: 10.0,
            high: 20.0,
            critical: 95.0,
        });
    let pii = ScoringRule::new(
        "pii_detected",
        vec![Condition::new("data.pii_detected", ConditionOperator::Equals, true)],
        AdjustmentType::Multiply,
        1.5,
    );
    let ctx = RequestContext::new("POST", "/records").with_data_factor("pii_detected", json!(true));

    let assessment = ScoringEngine::new().score(&ctx, &profile, &[Arc::new(pii)]);

    assert!((assessment.breakdown.adjusted_score - 54.0).abs() < 1e-9);
    let expected = assessment.breakdown.weighted_score * 0.7 + 54.0 * 0.3;
    assert!((assessment.score - expected.clamp(0.0, 100.0)).abs() < 1e-9);
    assert_eq!(assessment.level, profile.thresholds.level_for(assessment.score));
}

#[test]
fn test_score_always_clamped() {
    let engine = ScoringEngine::new();
    let contexts = [
        RequestContext::new("GET", "/"),
        RequestContext::new("GET", "/")
            .with_data_factor("credentials", json!(true))
            .with_security_factor("injection_detected", json!(true))
            .with_security_factor("known_vulnerabilities", json!(40))
            .with_context_factor("compliance_violations", json!(9))
            .with_context_factor("public_endpoint", json!(true)),
    ];
    let adjustments = [
        (AdjustmentType::Add, 500.0),
        (AdjustmentType::Subtract, 500.0),
        (AdjustmentType::Multiply, 40.0),
        (AdjustmentType::Divide, 0.001),
        (AdjustmentType::Set, -1000.0),
    ];

    for base in [0.0, 30.0, 100.0] {
        let profile = RiskProfile::new("p", RiskLevel::Medium, base).with_multiplier("public_endpoint", 9.0);
        for (kind, value) in adjustments {
            let rules = vec![Arc::new(ScoringRule::new("r", vec![], kind, value))];
            for ctx in &contexts {
                let score = engine.score(ctx, &profile, &rules).score;
                assert!((0.0..=100.0).contains(&score), "score {} out of range", score);
            }
        }
    }
}

#[test]
fn test_add_adjustment_never_lowers_score() {
    let engine = ScoringEngine::new();
    let profile = RiskProfile::new("p", RiskLevel::Medium, 30.0);
    let ctx = RequestContext::new("GET", "/").with_security_factor("mfa_enabled", json!(true));
    let baseline = engine.score(&ctx, &profile, &[]);

    for value in [0.0, 0.5, 10.0, 250.0] {
        let add = Arc::new(ScoringRule::new("add", vec![], AdjustmentType::Add, value));
        let with_add = engine.score(&ctx, &profile, &[add]);
        assert!(with_add.breakdown.blended_score >= baseline.breakdown.blended_score);
        assert!(with_add.score >= baseline.score);
    }
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let mut guarded = rule(
        "guarded",
        70,
        vec![
            Condition::new("header.x-api-key", ConditionOperator::NotExists, Value::Null),
            Condition::new("path", ConditionOperator::StartsWith, "/api"),
        ],
        ActionType::Block,
    );
    guarded.scope.endpoints = vec!["/api/*".to_string()];
    let source = DecisionEngine::builder()
        .with_entities(
            vec![
                guarded,
                rule(
                    "alert-bots",
                    40,
                    vec![Condition::new("user_agent", ConditionOperator::Regex, "(?i)bot")],
                    ActionType::Alert,
                ),
            ],
            vec![ScoringRule::new("s1", vec![], AdjustmentType::Add, 5.0)],
            RiskProfile::standard_set(),
        )
        .build()
        .await
        .unwrap();

    let bundle = source.export().await.unwrap();
    let json = bundle.to_json().unwrap();
    let parsed = decision_engine::parser::parse_bundle(&json).unwrap();

    let target = DecisionEngine::builder()
        .with_entities(vec![Rule::new("guarded", "stale")], vec![], vec![])
        .build()
        .await
        .unwrap();
    let report = target.import(parsed, true).await.unwrap();
    assert_eq!(report.failed, 0);

    let exported = source.list_rules(&Filter::new()).await.unwrap();
    let imported = target.list_rules(&Filter::new()).await.unwrap();
    let content = |rules: &[Rule]| {
        let mut items: Vec<_> = rules
            .iter()
            .map(|r| (r.id.clone(), r.conditions.clone(), r.actions.clone(), r.scope.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    };
    assert_eq!(content(&exported), content(&imported));
    assert_eq!(target.list_profiles(&Filter::new()).await.unwrap().len(), 4);
    assert_eq!(target.get_profile("standard").await.unwrap().base_score, 30.0);
    assert_eq!(target.get_scoring_rule("s1").await.unwrap().adjustment.value, 5.0);
    assert_eq!(target.list_scoring_rules(&Filter::new()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_import_rejects_tampered_bundle() {
    let source = engine_with(vec![rule(
        "r",
        10,
        vec![Condition::new("path", ConditionOperator::Equals, "/x")],
        ActionType::Log,
    )])
    .await;
    let mut bundle = source.export().await.unwrap();
    bundle.rules[0].priority = 100;

    let target = engine_with(vec![]).await;
    let err = target.import(bundle, true).await.unwrap_err();
    assert!(matches!(err, EngineError::Integrity { .. }));
    assert!(target.rules().snapshot().is_empty());
}

#[tokio::test]
async fn test_import_without_overwrite_keeps_existing() {
    let original = rule(
        "r",
        10,
        vec![Condition::new("path", ConditionOperator::Equals, "/x")],
        ActionType::Log,
    );
    let mut changed = original.clone();
    changed.priority = 60;

    let bundle = decision_engine::bundle::ExportBundle::new(vec![changed], vec![], vec![]).unwrap();
    let target = engine_with(vec![original]).await;
    let report = target.import(bundle, false).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(target.get_rule("r").await.unwrap().priority, 10);
}

#[tokio::test]
async fn test_dispatch_failures_do_not_change_decision() {
    let bus = Arc::new(InMemoryEventBus::new());
    bus.fail_topic("block-requests");
    let engine = DecisionEngine::builder()
        .with_entities(
            vec![rule(
                "block",
                50,
                vec![Condition::new("path", ConditionOperator::Equals, "/x")],
                ActionType::Block,
            )],
            vec![],
            vec![],
        )
        .with_publisher(bus.clone())
        .build()
        .await
        .unwrap();

    let (decision, report) = engine.evaluate_and_dispatch(&fixed_ctx()).await;
    assert!(!decision.allow);
    assert_eq!(report.failed, 1);
    assert_eq!(bus.events_on("policy-decisions").len(), 1);
}
