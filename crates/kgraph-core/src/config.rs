use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Whether type compatibility is enforced during validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    #[default]
    Strict,
    /// Accepts any subject/object pairing. Meant for pre-existing untyped
    /// data; distinct-endpoint rules still apply.
    Legacy,
}

impl SchemaMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Legacy => "legacy",
        }
    }

    #[must_use]
    pub fn checks_types(&self) -> bool {
        matches!(self, Self::Strict)
    }
}

impl std::str::FromStr for SchemaMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "legacy" => Ok(Self::Legacy),
            other => Err(Error::Config(format!(
                "schema mode must be 'strict' or 'legacy', got '{other}'"
            ))),
        }
    }
}

/// Tunables consumed by the pipeline stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Minimum oracle score for a mention or entity to count as a duplicate.
    pub similarity_threshold: f64,
    /// Minimum oracle score for a relation phrase to map onto a relation name.
    pub relation_similarity_threshold: f64,
    pub min_evidence_words: usize,
    #[serde(default)]
    pub schema_mode: SchemaMode,
    pub enable_clustering: bool,
    pub oracle_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            relation_similarity_threshold: 0.8,
            min_evidence_words: 3,
            schema_mode: SchemaMode::Strict,
            enable_clustering: true,
            oracle_timeout: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `KG_*` environment variables. Values that are
    /// present but malformed are an error rather than silently ignored.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("KG_SCHEMA_MODE") {
            config.schema_mode = v.parse()?;
        }
        if let Some(v) = lookup("KG_SIMILARITY_THRESHOLD") {
            config.similarity_threshold = parse_var("KG_SIMILARITY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("KG_RELATION_SIMILARITY_THRESHOLD") {
            config.relation_similarity_threshold = parse_var("KG_RELATION_SIMILARITY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("KG_MIN_EVIDENCE_WORDS") {
            config.min_evidence_words = parse_var("KG_MIN_EVIDENCE_WORDS", &v)?;
        }
        if let Some(v) = lookup("KG_ENABLE_CLUSTERING") {
            config.enable_clustering = parse_flag("KG_ENABLE_CLUSTERING", &v)?;
        }
        if let Some(v) = lookup("KG_ORACLE_TIMEOUT_MS") {
            config.oracle_timeout = Duration::from_millis(parse_var("KG_ORACLE_TIMEOUT_MS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("similarity_threshold", self.similarity_threshold),
            ("relation_similarity_threshold", self.relation_similarity_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.min_evidence_words == 0 {
            return Err(Error::Config("min_evidence_words must be at least 1".into()));
        }
        if self.oracle_timeout.is_zero() {
            return Err(Error::Config("oracle_timeout must be positive".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} has invalid value '{value}'")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key} has invalid value '{value}'"))),
    }
}
