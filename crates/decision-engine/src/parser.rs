//! Rule file parsing.
//!
//! A rule file is YAML or JSON and holds one of:
//! - an export bundle (recognized by its `format_version` key)
//! - a list of rules
//! - a mapping with `rules`, `scoring_rules` and/or `profiles` lists
//! - a single rule
//!
//! YAML files may also hold several rule documents separated by `---`.

use crate::bundle::ExportBundle;
use crate::error::{EngineError, Result};
use crate::policy::Rule;
use crate::profile::{RiskProfile, ScoringRule};
use serde::Deserialize;
use serde_json::Value as Json;

/// Supported file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    /// Detects format from file extension.
    pub fn from_extension(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            Some(Format::Yaml)
        } else if lower.ends_with(".json") {
            Some(Format::Json)
        } else {
            None
        }
    }

    /// Detects format from content.
    pub fn detect(content: &str) -> Self {
        let trimmed = content.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            Format::Json
        } else {
            Format::Yaml
        }
    }
}

/// Everything a rule file can contribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub scoring_rules: Vec<ScoringRule>,
    pub profiles: Vec<RiskProfile>,
    /// Set when the file was an export bundle.
    pub checksum: Option<String>,
}

impl RuleSet {
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();
        let collect = |result: Result<()>, issues: &mut Vec<String>| {
            if let Err(err) = result {
                match err {
                    EngineError::Validation(found) => issues.extend(found),
                    other => issues.push(other.to_string()),
                }
            }
        };
        for rule in &self.rules {
            collect(rule.validate(), &mut issues);
        }
        for rule in &self.scoring_rules {
            collect(rule.validate(), &mut issues);
        }
        for profile in &self.profiles {
            collect(profile.validate(), &mut issues);
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(issues))
        }
    }
}

#[derive(Deserialize)]
struct Sections {
    #[serde(default)]
    rules: Vec<Rule>,
    #[serde(default)]
    scoring_rules: Vec<ScoringRule>,
    #[serde(default)]
    profiles: Vec<RiskProfile>,
}

/// Parses a rule file, auto-detecting the format.
pub fn parse_rule_set(content: &str) -> Result<RuleSet> {
    parse_rule_set_with_format(content, Format::detect(content))
}

/// Parses a rule file in the given format.
pub fn parse_rule_set_with_format(content: &str, format: Format) -> Result<RuleSet> {
    match format {
        Format::Json => from_document(serde_json::from_str(content)?),
        Format::Yaml => {
            let mut documents = yaml_documents(content)?;
            if documents.len() == 1 {
                return documents
                    .pop()
                    .map(from_document)
                    .unwrap_or_else(|| Ok(RuleSet::default()));
            }
            let mut set = RuleSet::default();
            for document in documents {
                let part = from_document(document)?;
                set.rules.extend(part.rules);
                set.scoring_rules.extend(part.scoring_rules);
                set.profiles.extend(part.profiles);
            }
            Ok(set)
        }
    }
}

/// Parses only the policy rules of a file.
pub fn parse_rules(content: &str) -> Result<Vec<Rule>> {
    Ok(parse_rule_set(content)?.rules)
}

/// Parses an export bundle. Does not verify its checksum.
pub fn parse_bundle(content: &str) -> Result<ExportBundle> {
    match Format::detect(content) {
        Format::Json => Ok(serde_json::from_str(content)?),
        Format::Yaml => Ok(serde_yaml::from_str(content)?),
    }
}

fn yaml_documents(content: &str) -> Result<Vec<Json>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Json::deserialize(document)?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

fn from_document(document: Json) -> Result<RuleSet> {
    if document.is_null() {
        return Ok(RuleSet::default());
    }
    if document.is_array() {
        return Ok(RuleSet {
            rules: serde_json::from_value(document).map_err(parse_error)?,
            ..RuleSet::default()
        });
    }
    let Some(map) = document.as_object() else {
        return Err(EngineError::Parse(format!(
            "expected a rule, a rule list or a bundle, found {}",
            document
        )));
    };

    if map.contains_key("format_version") {
        let bundle: ExportBundle = serde_json::from_value(document).map_err(parse_error)?;
        return Ok(RuleSet {
            checksum: Some(bundle.checksum),
            rules: bundle.rules,
            scoring_rules: bundle.scoring_rules,
            profiles: bundle.profiles,
        });
    }

    let sectioned = ["rules", "scoring_rules", "profiles"]
        .iter()
        .any(|key| map.contains_key(*key));
    if sectioned {
        let sections: Sections = serde_json::from_value(document).map_err(parse_error)?;
        return Ok(RuleSet {
            rules: sections.rules,
            scoring_rules: sections.scoring_rules,
            profiles: sections.profiles,
            checksum: None,
        });
    }

    Ok(RuleSet {
        rules: vec![serde_json::from_value(document).map_err(parse_error)?],
        ..RuleSet::default()
    })
}

fn parse_error(err: serde_json::Error) -> EngineError {
    EngineError::Parse(err.to_string())
}
