//! Decision Engine
//!
//! Rule evaluation, decision resolution and risk scoring core for API
//! security services.
//!
//! A request context flows through the field resolver and condition
//! evaluator into the rule matcher. The policy resolver turns fired rules
//! into an allow/deny [`Decision`], and the action executor publishes the
//! side effects. Independently, the scoring engine turns the same context
//! into a [`RiskAssessment`].

pub mod actions;
pub mod audit;
pub mod bundle;
pub mod condition;
pub mod config;
pub mod context;
pub mod decision;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod fingerprint;
pub mod intel;
pub mod matcher;
pub mod net;
pub mod parser;
pub mod policy;
pub mod profile;
pub mod scoring;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod value;

pub use context::RequestContext;
pub use decision::{Decision, DecisionLevel, Vocabulary};
pub use engine::{DecisionEngine, DecisionEngineBuilder, RuleTestResult};
pub use error::{EngineError, Result};
pub use evaluator::PolicyResolver;
pub use policy::Rule;
pub use scoring::{RiskAssessment, ScoringEngine};

/// Version of the decision engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::actions::{ActionExecutor, EventPublisher, InMemoryEventBus};
    pub use crate::config::EngineConfig;
    pub use crate::context::RequestContext;
    pub use crate::decision::{Decision, DecisionLevel, Vocabulary};
    pub use crate::engine::DecisionEngine;
    pub use crate::error::{EngineError, Result};
    pub use crate::policy::{Rule, Scope};
    pub use crate::profile::{AdjustmentType, RiskLevel, RiskProfile, ScoringRule};
    pub use crate::scoring::RiskAssessment;
    pub use crate::store::{Filter, InMemoryRepository, Repository};
    pub use crate::types::*;
    pub use crate::value::Value;
}
