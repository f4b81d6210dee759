//! Export bundles: a checksummed copy of every managed entity.

use crate::error::{EngineError, Result};
use crate::fingerprint;
use crate::policy::Rule;
use crate::profile::{RiskProfile, ScoringRule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bundle layout version written by this crate.
pub const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub format_version: String,
    pub exported_at: DateTime<Utc>,
    /// SHA-256 over the canonical JSON of the three entity lists.
    pub checksum: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub scoring_rules: Vec<ScoringRule>,
    #[serde(default)]
    pub profiles: Vec<RiskProfile>,
}

#[derive(Serialize)]
struct Contents<'a> {
    rules: &'a [Rule],
    scoring_rules: &'a [ScoringRule],
    profiles: &'a [RiskProfile],
}

impl ExportBundle {
    pub fn new(
        rules: Vec<Rule>,
        scoring_rules: Vec<ScoringRule>,
        profiles: Vec<RiskProfile>,
    ) -> Result<Self> {
        let mut bundle = Self {
            format_version: FORMAT_VERSION.to_string(),
            exported_at: Utc::now(),
            checksum: String::new(),
            rules,
            scoring_rules,
            profiles,
        };
        bundle.checksum = bundle.compute_checksum()?;
        Ok(bundle)
    }

    pub fn compute_checksum(&self) -> Result<String> {
        fingerprint::checksum(&Contents {
            rules: &self.rules,
            scoring_rules: &self.scoring_rules,
            profiles: &self.profiles,
        })
    }

    /// Fails with `Integrity` if the contents do not match the checksum.
    pub fn verify(&self) -> Result<()> {
        let actual = self.compute_checksum()?;
        if actual != self.checksum {
            return Err(EngineError::Integrity {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len() + self.scoring_rules.len() + self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| EngineError::Serialization(e.to_string()))
    }
}

/// Outcome of one item in a batch or import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemResult {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: &EngineError) -> Self {
        Self {
            id: id.into(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    /// Existing entities left alone because overwrite was off.
    pub skipped: usize,
    pub failed: usize,
    pub items: Vec<ItemResult>,
}

impl ImportReport {
    pub(crate) fn record(&mut self, id: &str, outcome: Result<bool>) {
        match outcome {
            Ok(true) => {
                self.imported += 1;
                self.items.push(ItemResult::ok(id));
            }
            Ok(false) => {
                self.skipped += 1;
                self.items.push(ItemResult {
                    id: id.to_string(),
                    success: true,
                    error: Some("already exists".to_string()),
                });
            }
            Err(err) => {
                self.failed += 1;
                self.items.push(ItemResult::failed(id, &err));
            }
        }
    }
}
