//! The decision engine facade.
//!
//! Ties the stores, the policy resolver, the scoring engine and the action
//! executor together behind the evaluation and management operations.

use crate::actions::{ActionExecutor, DispatchReport, EventPublisher, TracingPublisher};
use crate::audit;
use crate::bundle::{ExportBundle, ImportReport, ItemResult};
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::decision::Decision;
use crate::error::Result;
use crate::evaluator::PolicyResolver;
use crate::intel::{IntelAggregator, ThreatIntelProvider};
use crate::matcher::ConditionMatch;
use crate::policy::Rule;
use crate::profile::{RiskLevel, RiskProfile, ScoringRule};
use crate::scoring::{RiskAssessment, ScoringEngine};
use crate::snapshot::Entity;
use crate::store::{
    EntityStore, Filter, InMemoryRepository, ProfileStore, Repository, RuleStore, ScoringRuleStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Result of a dry run of one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTestResult {
    pub rule_id: String,
    /// Enabled, active and in scope for the context.
    pub applicable: bool,
    /// Whether the conditions match, regardless of applicability.
    pub matched: bool,
    pub matched_conditions: Vec<ConditionMatch>,
    pub confidence: f64,
    /// Decision this rule alone would produce.
    pub decision: Decision,
}

/// Builds a [`DecisionEngine`], loading every store before returning.
#[derive(Debug, Default)]
pub struct DecisionEngineBuilder {
    config: EngineConfig,
    rules: Option<Arc<dyn Repository<Rule>>>,
    scoring_rules: Option<Arc<dyn Repository<ScoringRule>>>,
    profiles: Option<Arc<dyn Repository<RiskProfile>>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    providers: Vec<Arc<dyn ThreatIntelProvider>>,
}

impl DecisionEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_rule_repository(mut self, repository: Arc<dyn Repository<Rule>>) -> Self {
        self.rules = Some(repository);
        self
    }

    pub fn with_scoring_repository(mut self, repository: Arc<dyn Repository<ScoringRule>>) -> Self {
        self.scoring_rules = Some(repository);
        self
    }

    pub fn with_profile_repository(mut self, repository: Arc<dyn Repository<RiskProfile>>) -> Self {
        self.profiles = Some(repository);
        self
    }

    /// Seeds in-memory repositories from a parsed rule set.
    pub fn with_entities(
        self,
        rules: Vec<Rule>,
        scoring_rules: Vec<ScoringRule>,
        profiles: Vec<RiskProfile>,
    ) -> Self {
        self.with_rule_repository(Arc::new(InMemoryRepository::with_items(rules)))
            .with_scoring_repository(Arc::new(InMemoryRepository::with_items(scoring_rules)))
            .with_profile_repository(Arc::new(InMemoryRepository::with_items(profiles)))
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_intel_provider(mut self, provider: Arc<dyn ThreatIntelProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Loads every store. Any load failure is a startup failure.
    pub async fn build(self) -> Result<DecisionEngine> {
        self.config.validate()?;

        let rules = Arc::new(store_over(self.rules));
        let scoring_rules = Arc::new(store_over(self.scoring_rules));
        let profiles = Arc::new(store_over(self.profiles));
        rules.load().await?;
        scoring_rules.load().await?;
        profiles.load().await?;

        let publisher = self
            .publisher
            .unwrap_or_else(|| Arc::new(TracingPublisher) as Arc<dyn EventPublisher>);
        let executor = Arc::new(ActionExecutor::new(
            publisher,
            self.config.topics.clone(),
            self.config.publish_timeout(),
        ));
        let intel = self
            .providers
            .into_iter()
            .fold(IntelAggregator::new(self.config.provider_timeout()), |agg, p| {
                agg.with_provider(p)
            });

        tracing::info!(
            vocabulary = ?self.config.vocabulary,
            rules = rules.snapshot().len(),
            scoring_rules = scoring_rules.snapshot().len(),
            profiles = profiles.snapshot().len(),
            intel_providers = intel.provider_count(),
            "Decision engine ready"
        );

        Ok(DecisionEngine {
            resolver: PolicyResolver::new(self.config.vocabulary),
            scoring: ScoringEngine::new(),
            builtin_profiles: RiskProfile::standard_set().into_iter().map(Arc::new).collect(),
            config: self.config,
            rules,
            scoring_rules,
            profiles,
            executor,
            intel,
        })
    }
}

fn store_over<T: Entity>(repository: Option<Arc<dyn Repository<T>>>) -> EntityStore<T> {
    match repository {
        Some(repository) => EntityStore::new(repository),
        None => EntityStore::in_memory(),
    }
}

/// Evaluation and management entry point.
#[derive(Debug)]
pub struct DecisionEngine {
    config: EngineConfig,
    rules: Arc<RuleStore>,
    scoring_rules: Arc<ScoringRuleStore>,
    profiles: Arc<ProfileStore>,
    resolver: PolicyResolver,
    scoring: ScoringEngine,
    /// Used when no profile is managed.
    builtin_profiles: Vec<Arc<RiskProfile>>,
    executor: Arc<ActionExecutor>,
    intel: IntelAggregator,
}

impl DecisionEngine {
    pub fn builder() -> DecisionEngineBuilder {
        DecisionEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn scoring_rules(&self) -> &Arc<ScoringRuleStore> {
        &self.scoring_rules
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    // Evaluation

    /// Resolves a decision against the current rule snapshot. Action
    /// dispatch and the decision event are published in the background.
    pub fn evaluate(&self, ctx: &RequestContext) -> Decision {
        let decision = self.decide(ctx);
        self.dispatch_in_background(&decision, ctx);
        decision
    }

    /// Like [`evaluate`](Self::evaluate) but waits for dispatch to settle.
    pub async fn evaluate_and_dispatch(&self, ctx: &RequestContext) -> (Decision, DispatchReport) {
        let decision = self.decide(ctx);
        let report = self.executor.execute(&decision, ctx).await;
        self.executor
            .publish_record(&self.config.topics.policy_decisions, &decision)
            .await;
        (decision, report)
    }

    fn decide(&self, ctx: &RequestContext) -> Decision {
        let snapshot = self.rules.snapshot();
        let decision = self.resolver.resolve(snapshot.items(), ctx);
        audit::emit_decision(&decision);
        decision
    }

    fn dispatch_in_background(&self, decision: &Decision, ctx: &RequestContext) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!(
                request_id = %decision.request_id,
                "No async runtime; actions not dispatched"
            );
            return;
        }
        let executor = Arc::clone(&self.executor);
        let topic = self.config.topics.policy_decisions.clone();
        let decision = decision.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            executor.execute(&decision, &ctx).await;
            executor.publish_record(&topic, &decision).await;
        });
    }

    /// Scores the context. The assessment is published in the background.
    pub fn score(&self, ctx: &RequestContext) -> RiskAssessment {
        let assessment = self.assess(ctx);
        if tokio::runtime::Handle::try_current().is_ok() {
            let executor = Arc::clone(&self.executor);
            let topic = self.config.topics.risk_assessments.clone();
            let record = assessment.clone();
            tokio::spawn(async move {
                executor.publish_record(&topic, &record).await;
            });
        }
        assessment
    }

    /// Scores the context without publishing anything.
    pub fn assess(&self, ctx: &RequestContext) -> RiskAssessment {
        let managed = self.profiles.snapshot();
        let profiles = if managed.is_empty() {
            &self.builtin_profiles[..]
        } else {
            managed.items()
        };
        let profile = ScoringEngine::select_profile(ctx, profiles)
            .unwrap_or_else(|| Arc::new(RiskProfile::new("standard", RiskLevel::Medium, 30.0)));
        let rules = self.scoring_rules.snapshot();
        let assessment = self.scoring.score(ctx, &profile, rules.items());
        audit::emit_assessment(&assessment);
        assessment
    }

    /// Adds threat-intel factors to the context.
    pub async fn enrich(&self, ctx: &RequestContext) -> RequestContext {
        self.intel.enrich(ctx).await
    }

    /// Dry-runs one rule, enabled or not, against the context. Nothing is
    /// dispatched.
    pub async fn test_rule(&self, rule_id: &str, ctx: &RequestContext) -> Result<RuleTestResult> {
        let rule = self.rules.get(rule_id).await?;
        let applicable = PolicyResolver::is_applicable(&rule, ctx);
        let result = self.resolver.matcher().match_rule(&rule, ctx);
        let decision = self.resolver.resolve(&[Arc::new(rule)], ctx);
        Ok(RuleTestResult {
            rule_id: rule_id.to_string(),
            applicable,
            matched: result.matched,
            matched_conditions: result.matched_conditions,
            confidence: result.confidence,
            decision,
        })
    }

    // Management

    pub async fn create_rule(&self, rule: Rule) -> Result<Rule> {
        self.rules.create(rule).await
    }

    pub async fn update_rule(&self, rule: Rule) -> Result<Rule> {
        let updated = self.rules.update(rule).await?;
        self.flush_patterns();
        Ok(updated)
    }

    pub async fn delete_rule(&self, id: &str) -> Result<()> {
        self.rules.delete(id).await?;
        self.flush_patterns();
        Ok(())
    }

    pub async fn get_rule(&self, id: &str) -> Result<Rule> {
        self.rules.get(id).await
    }

    pub async fn list_rules(&self, filter: &Filter) -> Result<Vec<Rule>> {
        self.rules.list(filter).await
    }

    /// Creates each rule independently; one failure does not stop the rest.
    pub async fn batch_create(&self, rules: Vec<Rule>) -> Vec<ItemResult> {
        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            let id = rule.id.clone();
            results.push(match self.rules.create(rule).await {
                Ok(_) => ItemResult::ok(id),
                Err(err) => ItemResult::failed(id, &err),
            });
        }
        results
    }

    /// Updates each rule independently; one failure does not stop the rest.
    pub async fn batch_update(&self, rules: Vec<Rule>) -> Vec<ItemResult> {
        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            let id = rule.id.clone();
            results.push(match self.rules.update(rule).await {
                Ok(_) => ItemResult::ok(id),
                Err(err) => ItemResult::failed(id, &err),
            });
        }
        results
    }

    pub async fn create_scoring_rule(&self, rule: ScoringRule) -> Result<ScoringRule> {
        self.scoring_rules.create(rule).await
    }

    pub async fn update_scoring_rule(&self, rule: ScoringRule) -> Result<ScoringRule> {
        let updated = self.scoring_rules.update(rule).await?;
        self.flush_patterns();
        Ok(updated)
    }

    pub async fn delete_scoring_rule(&self, id: &str) -> Result<()> {
        self.scoring_rules.delete(id).await?;
        self.flush_patterns();
        Ok(())
    }

    pub async fn get_scoring_rule(&self, id: &str) -> Result<ScoringRule> {
        self.scoring_rules.get(id).await
    }

    pub async fn list_scoring_rules(&self, filter: &Filter) -> Result<Vec<ScoringRule>> {
        self.scoring_rules.list(filter).await
    }

    pub async fn create_profile(&self, profile: RiskProfile) -> Result<RiskProfile> {
        self.profiles.create(profile).await
    }

    pub async fn update_profile(&self, profile: RiskProfile) -> Result<RiskProfile> {
        self.profiles.update(profile).await
    }

    pub async fn delete_profile(&self, id: &str) -> Result<()> {
        self.profiles.delete(id).await
    }

    pub async fn get_profile(&self, id: &str) -> Result<RiskProfile> {
        self.profiles.get(id).await
    }

    pub async fn list_profiles(&self, filter: &Filter) -> Result<Vec<RiskProfile>> {
        self.profiles.list(filter).await
    }

    /// Exports every managed entity from the repositories.
    pub async fn export(&self) -> Result<ExportBundle> {
        let all = Filter::new();
        ExportBundle::new(
            self.rules.list(&all).await?,
            self.scoring_rules.list(&all).await?,
            self.profiles.list(&all).await?,
        )
    }

    /// Imports a bundle after verifying its checksum. Existing entities are
    /// replaced only when `overwrite` is set.
    pub async fn import(&self, bundle: ExportBundle, overwrite: bool) -> Result<ImportReport> {
        bundle.verify()?;

        let mut report = ImportReport::default();
        for profile in bundle.profiles {
            let id = profile.id.clone();
            report.record(&id, self.profiles.put(profile, overwrite).await);
        }
        for rule in bundle.scoring_rules {
            let id = rule.id.clone();
            report.record(&id, self.scoring_rules.put(rule, overwrite).await);
        }
        for rule in bundle.rules {
            let id = rule.id.clone();
            report.record(&id, self.rules.put(rule, overwrite).await);
        }

        tracing::info!(
            imported = report.imported,
            skipped = report.skipped,
            failed = report.failed,
            overwrite,
            "Bundle imported"
        );
        Ok(report)
    }

    /// Reloads every snapshot. Stale snapshots stay in force on failure.
    pub async fn refresh(&self) -> Result<()> {
        self.rules.refresh().await?;
        self.scoring_rules.refresh().await?;
        self.profiles.refresh().await?;
        self.flush_patterns();
        Ok(())
    }

    /// Drops compiled patterns so edited or deleted rules release theirs.
    fn flush_patterns(&self) {
        self.resolver.matcher().evaluator().clear_patterns();
        self.scoring.matcher().evaluator().clear_patterns();
    }

    /// Starts the background refresh loops at the configured interval.
    pub fn spawn_refresh(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let period = self.config.refresh_interval();
        vec![
            self.rules.spawn_refresh(period, shutdown.clone()),
            self.scoring_rules.spawn_refresh(period, shutdown.clone()),
            self.profiles.spawn_refresh(period, shutdown),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::InMemoryEventBus;
    use crate::types::{Action, ActionType, Condition, ConditionOperator};
    use std::time::Duration;

    fn block_admin() -> Rule {
        Rule {
            priority: 80,
            conditions: vec![Condition::new("path", ConditionOperator::StartsWith, "/admin")],
            actions: vec![Action::block()],
            ..Rule::new("block-admin", "Block admin")
        }
    }

    #[tokio::test]
    async fn test_evaluate_sees_created_rule() {
        let engine = DecisionEngine::builder().build().await.unwrap();
        let ctx = RequestContext::new("GET", "/admin/users");
        assert!(engine.evaluate(&ctx).allow);

        engine.create_rule(block_admin()).await.unwrap();
        let decision = engine.evaluate(&ctx);
        assert!(!decision.allow);
        assert_eq!(decision.reason, "Block admin");
    }

    #[tokio::test]
    async fn test_background_dispatch_publishes() {
        let bus = Arc::new(InMemoryEventBus::new());
        let engine = DecisionEngine::builder()
            .with_entities(vec![block_admin()], vec![], vec![])
            .with_publisher(bus.clone())
            .build()
            .await
            .unwrap();

        engine.evaluate(&RequestContext::new("GET", "/admin"));
        for _ in 0..50 {
            if bus.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bus.events_on("block-requests").len(), 1);
        assert_eq!(bus.events_on("policy-decisions").len(), 1);
    }

    #[tokio::test]
    async fn test_rule_dry_run() {
        let mut rule = block_admin();
        rule.enabled = false;
        let engine = DecisionEngine::builder()
            .with_entities(vec![rule], vec![], vec![])
            .build()
            .await
            .unwrap();

        let result = engine
            .test_rule("block-admin", &RequestContext::new("GET", "/admin"))
            .await
            .unwrap();
        assert!(!result.applicable);
        assert!(result.matched);
        assert!(result.decision.allow);

        let missing = engine.test_rule("nope", &RequestContext::new("GET", "/")).await;
        assert!(missing.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_batch_create_reports_per_item() {
        let engine = DecisionEngine::builder().build().await.unwrap();
        let results = engine
            .batch_create(vec![block_admin(), Rule::new("bad", ""), block_admin()])
            .await;
        let outcomes: Vec<bool> = results.iter().map(|r| r.success).collect();
        assert_eq!(outcomes, vec![true, false, false]);
        assert_eq!(engine.rules().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_rule_changes_release_patterns() {
        let mut bots = Rule {
            conditions: vec![Condition::new("user_agent", ConditionOperator::Regex, "(?i)bot")],
            actions: vec![Action::new(ActionType::Alert)],
            ..Rule::new("bots", "Bots")
        };
        let engine = DecisionEngine::builder()
            .with_entities(vec![bots.clone()], vec![], vec![])
            .build()
            .await
            .unwrap();
        let evaluator = engine.resolver.matcher().evaluator();

        engine.evaluate(&RequestContext::new("GET", "/").with_user_agent("crawlbot"));
        assert_eq!(evaluator.cached_patterns(), 1);

        bots.conditions[0] = Condition::new("user_agent", ConditionOperator::Regex, "spider");
        engine.update_rule(bots).await.unwrap();
        assert_eq!(evaluator.cached_patterns(), 0);
        let decision = engine.evaluate(&RequestContext::new("GET", "/").with_user_agent("spider"));
        assert_eq!(decision.matched_rule_ids(), vec!["bots"]);
        assert_eq!(evaluator.cached_patterns(), 1);

        engine.delete_rule("bots").await.unwrap();
        assert_eq!(evaluator.cached_patterns(), 0);
    }

    #[tokio::test]
    async fn test_builtin_profiles_used_when_none_managed() {
        let engine = DecisionEngine::builder().build().await.unwrap();
        let assessment = engine.assess(&RequestContext::new("GET", "/"));
        assert_eq!(assessment.profile_used, "standard");
    }
}
