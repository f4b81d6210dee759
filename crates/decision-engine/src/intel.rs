//! Threat-intelligence enrichment.
//!
//! Providers are queried concurrently, each under its own deadline. A
//! provider that fails or times out is logged and contributes nothing; the
//! aggregate is built from whoever answered.

use crate::context::RequestContext;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One provider's opinion of an indicator (IP, domain, hash).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reputation {
    pub provider: String,
    /// 0 (benign) to 100 (certainly malicious).
    pub score: f64,
    pub malicious: bool,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl Reputation {
    pub fn clean(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            score: 0.0,
            malicious: false,
            categories: Vec::new(),
        }
    }

    pub fn malicious(provider: impl Into<String>, score: f64) -> Self {
        Self {
            provider: provider.into(),
            score,
            malicious: true,
            categories: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }
}

/// A source of reputation data.
#[async_trait]
pub trait ThreatIntelProvider: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn lookup(&self, indicator: &str) -> Result<Reputation>;
}

/// Combined view across providers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateReputation {
    pub indicator: String,
    /// Highest score reported.
    pub score: f64,
    /// True if any provider flagged the indicator.
    pub malicious: bool,
    /// Union of categories, sorted.
    pub categories: Vec<String>,
    /// Providers that answered in time.
    pub providers: Vec<String>,
}

impl AggregateReputation {
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[derive(Debug)]
pub struct IntelAggregator {
    providers: Vec<Arc<dyn ThreatIntelProvider>>,
    timeout: Duration,
}

impl IntelAggregator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            timeout,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn ThreatIntelProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Queries every provider concurrently and merges the answers.
    pub async fn lookup(&self, indicator: &str) -> AggregateReputation {
        let lookups = self.providers.iter().map(|provider| async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.timeout, provider.lookup(indicator)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    operation: format!("{} lookup", provider.name()),
                    elapsed: started.elapsed(),
                }),
            };
            (provider.name().to_string(), outcome)
        });

        let mut aggregate = AggregateReputation {
            indicator: indicator.to_string(),
            ..AggregateReputation::default()
        };
        let mut categories = BTreeSet::new();

        for (provider, outcome) in join_all(lookups).await {
            match outcome {
                Ok(reputation) => {
                    aggregate.score = aggregate.score.max(reputation.score.clamp(0.0, 100.0));
                    aggregate.malicious |= reputation.malicious;
                    categories.extend(reputation.categories);
                    aggregate.providers.push(provider);
                }
                Err(err) => {
                    tracing::warn!(
                        provider = %provider,
                        indicator = %indicator,
                        error = %err,
                        "Threat-intel lookup failed, continuing with others"
                    );
                }
            }
        }

        aggregate.categories = categories.into_iter().collect();
        aggregate
    }

    /// Returns `ctx` with `ip_reputation` and `malicious_ip` security
    /// factors set from the client IP's reputation. The context is returned
    /// unchanged when there is no client IP or nobody answered.
    pub async fn enrich(&self, ctx: &RequestContext) -> RequestContext {
        let Some(ip) = ctx.client_ip.as_deref() else {
            return ctx.clone();
        };
        let reputation = self.lookup(ip).await;
        if reputation.is_empty() {
            return ctx.clone();
        }
        tracing::debug!(
            request_id = %ctx.request_id,
            ip = %ip,
            score = reputation.score,
            malicious = reputation.malicious,
            "Context enriched with threat intel"
        );
        ctx.clone()
            .with_security_factor("ip_reputation", serde_json::json!(reputation.score))
            .with_security_factor("malicious_ip", serde_json::json!(reputation.malicious))
            .with_security_factor(
                "threat_categories",
                serde_json::json!(reputation.categories),
            )
    }
}

/// Provider answering from a fixed table. Unknown indicators are clean.
#[derive(Debug, Default)]
pub struct StaticProvider {
    name: String,
    entries: std::collections::HashMap<String, Reputation>,
    latency: Option<Duration>,
    failing: bool,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_entry(mut self, indicator: impl Into<String>, mut reputation: Reputation) -> Self {
        reputation.provider = self.name.clone();
        self.entries.insert(indicator.into(), reputation);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every lookup fail.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }
}

#[async_trait]
impl ThreatIntelProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, indicator: &str) -> Result<Reputation> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing {
            return Err(EngineError::Provider {
                provider: self.name.clone(),
                message: "unavailable".to_string(),
            });
        }
        Ok(self
            .entries
            .get(indicator)
            .cloned()
            .unwrap_or_else(|| Reputation::clean(&self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BAD_IP: &str = "203.0.113.9";

    fn aggregator() -> IntelAggregator {
        IntelAggregator::new(Duration::from_millis(200))
            .with_provider(Arc::new(
                StaticProvider::new("alpha")
                    .with_entry(BAD_IP, Reputation::malicious("", 70.0).with_category("botnet")),
            ))
            .with_provider(Arc::new(StaticProvider::new("beta").with_entry(
                BAD_IP,
                Reputation {
                    provider: String::new(),
                    score: 85.0,
                    malicious: false,
                    categories: vec!["scanner".to_string(), "botnet".to_string()],
                },
            )))
    }

    #[tokio::test]
    async fn test_aggregate_merges_providers() {
        let reputation = aggregator().lookup(BAD_IP).await;
        assert_eq!(reputation.score, 85.0);
        assert!(reputation.malicious);
        assert_eq!(reputation.categories, vec!["botnet", "scanner"]);
        assert_eq!(reputation.providers, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_failed_provider_contributes_nothing() {
        let aggregator = aggregator().with_provider(Arc::new(StaticProvider::new("down").failing()));
        let reputation = aggregator.lookup(BAD_IP).await;
        assert_eq!(reputation.providers.len(), 2);
        assert!(reputation.malicious);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let aggregator = IntelAggregator::new(Duration::from_millis(50)).with_provider(Arc::new(
            StaticProvider::new("slow")
                .with_entry(BAD_IP, Reputation::malicious("", 99.0))
                .with_latency(Duration::from_secs(5)),
        ));
        let reputation = aggregator.lookup(BAD_IP).await;
        assert!(reputation.is_empty());
        assert!(!reputation.malicious);
    }

    #[tokio::test]
    async fn test_enrich_sets_security_factors() {
        let ctx = RequestContext::new("GET", "/").with_client_ip(BAD_IP);
        let enriched = aggregator().enrich(&ctx).await;
        assert!(enriched.factor_active("malicious_ip"));
        assert_eq!(enriched.factor_number("ip_reputation"), Some(85.0));

        let no_ip = RequestContext::new("GET", "/");
        let unchanged = aggregator().enrich(&no_ip).await;
        assert!(unchanged.security_factors.is_empty());
    }
}
