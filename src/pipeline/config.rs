//! Pipeline configuration.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `PAPER_COT_*` environment variables, then CLI overrides applied by the
//! caller. [`PipelineConfig::validate`] runs once all layers are in place and
//! before any record is touched.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::gate::{Stage, StageConfig};
use super::retry::RetryPolicy;
use super::status::ScoreField;
use crate::export::corpus::{CorpusFormat, CorpusSettings, DedupScope};
use crate::scoring::Rubric;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Stage name is not part of the pipeline.
    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    /// The YAML configuration file could not be parsed.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prompt template names, one per invoke stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateNames {
    pub profiling: String,
    pub extraction: String,
    pub critique: String,
    pub refinement: String,
    pub quality_assessment: String,
    pub voicing: String,
    pub voicing_assessment: String,
}

impl Default for TemplateNames {
    fn default() -> Self {
        Self {
            profiling: "paper_profiling".to_string(),
            extraction: "cot_extraction".to_string(),
            critique: "cot_critique".to_string(),
            refinement: "cot_refinement".to_string(),
            quality_assessment: "cot_quality_assessment".to_string(),
            voicing: "cot_voicing".to_string(),
            voicing_assessment: "cot_voicing_assessment".to_string(),
        }
    }
}

impl TemplateNames {
    /// Template used by an invoke stage; `None` for score stages.
    pub fn for_stage(&self, stage: Stage) -> Option<&str> {
        let name = match stage {
            Stage::Profile => &self.profiling,
            Stage::Extract => &self.extraction,
            Stage::Critique => &self.critique,
            Stage::Refine => &self.refinement,
            Stage::AssessQuality => &self.quality_assessment,
            Stage::Voice => &self.voicing,
            Stage::AssessVoicing => &self.voicing_assessment,
            Stage::ScoreProfile | Stage::ScoreQuality | Stage::ScoreVoicing => return None,
        };
        Some(name.as_str())
    }

    /// All configured names in stage order.
    pub fn all(&self) -> Vec<&str> {
        Stage::ALL
            .iter()
            .filter_map(|stage| self.for_stage(*stage))
            .collect()
    }
}

/// Rubrics applied by the three score stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rubrics {
    pub profiling: Rubric,
    pub quality: Rubric,
    pub voicing: Rubric,
}

impl Default for Rubrics {
    fn default() -> Self {
        Self {
            profiling: Rubric::profiling(),
            quality: Rubric::quality(),
            voicing: Rubric::voicing(),
        }
    }
}

/// Configuration for the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Storage settings
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Root of the artifact tree.
    pub artifact_root: PathBuf,
    /// Base directory for relative document locators.
    pub document_root: Option<PathBuf>,

    // Gate thresholds
    pub min_suitability: i64,
    pub min_quality: i64,
    pub min_voice: i64,

    // Model settings
    /// Directory holding prompt templates.
    pub template_dir: PathBuf,
    pub templates: TemplateNames,
    /// Model override; falls back to `LITELLM_DEFAULT_MODEL`.
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub retry: RetryPolicy,

    // Scoring and export
    pub rubrics: Rubrics,
    pub corpus: CorpusSettings,

    /// Default batch size for stage runs.
    pub batch_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./paper_cot.db"),
            artifact_root: PathBuf::from("./artifacts"),
            document_root: None,

            min_suitability: 8,
            min_quality: 4,
            min_voice: 3,

            template_dir: PathBuf::from("./templates"),
            templates: TemplateNames::default(),
            model: None,
            temperature: 0.7,
            max_tokens: None,
            system_prompt: None,
            retry: RetryPolicy::default(),

            rubrics: Rubrics::default(),
            corpus: CorpusSettings::default(),

            batch_limit: 10,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML file over the defaults. Missing keys keep their default.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Creates configuration from defaults plus environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PAPER_COT_DATABASE`: SQLite file (default: ./paper_cot.db)
    /// - `PAPER_COT_ARTIFACTS`: artifact root (default: ./artifacts)
    /// - `PAPER_COT_DOCUMENT_ROOT`: base directory for document locators
    /// - `PAPER_COT_TEMPLATES`: template directory (default: ./templates)
    /// - `PAPER_COT_MIN_SUITABILITY`, `PAPER_COT_MIN_QUALITY`, `PAPER_COT_MIN_VOICE`
    /// - `PAPER_COT_MODEL`, `PAPER_COT_TEMPERATURE`, `PAPER_COT_MAX_TOKENS`
    /// - `PAPER_COT_SYSTEM_PROMPT`
    /// - `PAPER_COT_MAX_ATTEMPTS`, `PAPER_COT_ATTEMPT_TIMEOUT_MS`
    /// - `PAPER_COT_DEDUP_SCOPE`, `PAPER_COT_MAX_PER_GROUP`, `PAPER_COT_FORMAT`,
    ///   `PAPER_COT_VALIDATION_FRACTION`
    /// - `PAPER_COT_BATCH_LIMIT`
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlays `PAPER_COT_*` environment variables.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlays values from `lookup`, which maps a variable name to its value.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Storage settings
        if let Some(val) = lookup("PAPER_COT_DATABASE") {
            self.database_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("PAPER_COT_ARTIFACTS") {
            self.artifact_root = PathBuf::from(val);
        }
        if let Some(val) = lookup("PAPER_COT_DOCUMENT_ROOT") {
            self.document_root = Some(PathBuf::from(val));
        }

        // Thresholds
        if let Some(val) = lookup("PAPER_COT_MIN_SUITABILITY") {
            self.min_suitability = parse_env_value(&val, "PAPER_COT_MIN_SUITABILITY")?;
        }
        if let Some(val) = lookup("PAPER_COT_MIN_QUALITY") {
            self.min_quality = parse_env_value(&val, "PAPER_COT_MIN_QUALITY")?;
        }
        if let Some(val) = lookup("PAPER_COT_MIN_VOICE") {
            self.min_voice = parse_env_value(&val, "PAPER_COT_MIN_VOICE")?;
        }

        // Model settings
        if let Some(val) = lookup("PAPER_COT_TEMPLATES") {
            self.template_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("PAPER_COT_MODEL") {
            self.model = Some(val);
        }
        if let Some(val) = lookup("PAPER_COT_TEMPERATURE") {
            self.temperature = parse_env_value(&val, "PAPER_COT_TEMPERATURE")?;
        }
        if let Some(val) = lookup("PAPER_COT_MAX_TOKENS") {
            self.max_tokens = Some(parse_env_value(&val, "PAPER_COT_MAX_TOKENS")?);
        }
        if let Some(val) = lookup("PAPER_COT_SYSTEM_PROMPT") {
            self.system_prompt = Some(val);
        }
        if let Some(val) = lookup("PAPER_COT_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env_value(&val, "PAPER_COT_MAX_ATTEMPTS")?;
        }
        if let Some(val) = lookup("PAPER_COT_ATTEMPT_TIMEOUT_MS") {
            self.retry.attempt_timeout_ms =
                parse_env_value(&val, "PAPER_COT_ATTEMPT_TIMEOUT_MS")?;
        }

        // Corpus settings
        if let Some(val) = lookup("PAPER_COT_DEDUP_SCOPE") {
            self.corpus.dedup_scope = parse_env_value::<DedupScope>(&val, "PAPER_COT_DEDUP_SCOPE")?;
        }
        if let Some(val) = lookup("PAPER_COT_MAX_PER_GROUP") {
            self.corpus.max_per_group = parse_env_value(&val, "PAPER_COT_MAX_PER_GROUP")?;
        }
        if let Some(val) = lookup("PAPER_COT_FORMAT") {
            self.corpus.format = parse_env_value::<CorpusFormat>(&val, "PAPER_COT_FORMAT")?;
        }
        if let Some(val) = lookup("PAPER_COT_VALIDATION_FRACTION") {
            self.corpus.validation_fraction =
                parse_env_value(&val, "PAPER_COT_VALIDATION_FRACTION")?;
        }
        if let Some(val) = lookup("PAPER_COT_BATCH_LIMIT") {
            self.batch_limit = parse_env_value(&val, "PAPER_COT_BATCH_LIMIT")?;
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_path cannot be empty".to_string(),
            ));
        }
        if self.artifact_root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "artifact_root cannot be empty".to_string(),
            ));
        }

        for (key, value) in [
            ("min_suitability", self.min_suitability),
            ("min_quality", self.min_quality),
            ("min_voice", self.min_voice),
        ] {
            if value < 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} cannot be negative",
                    key
                )));
            }
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if let Some(empty) = self.templates.all().into_iter().find(|t| t.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(format!(
                "template names cannot be empty (got '{}')",
                empty
            )));
        }

        self.retry.validate()?;

        for rubric in [
            &self.rubrics.profiling,
            &self.rubrics.quality,
            &self.rubrics.voicing,
        ] {
            rubric.check().map_err(ConfigError::ValidationFailed)?;
        }

        self.corpus.validate()?;

        if self.batch_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Threshold for a score field.
    pub fn threshold(&self, field: ScoreField) -> i64 {
        match field {
            ScoreField::Suitability => self.min_suitability,
            ScoreField::Quality => self.min_quality,
            ScoreField::Voice => self.min_voice,
        }
    }

    /// Gate configuration for `stage`.
    pub fn stage_config(&self, stage: Stage) -> Result<StageConfig, ConfigError> {
        let min_score = stage.rule().gate.map(|field| self.threshold(field));
        StageConfig::new(stage, min_score)
    }

    /// Builder method to set the database path.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Builder method to set the artifact root.
    pub fn with_artifact_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_root = path.into();
        self
    }

    pub fn with_document_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.document_root = Some(path.into());
        self
    }

    pub fn with_template_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_dir = path.into();
        self
    }

    pub fn with_min_suitability(mut self, min: i64) -> Self {
        self.min_suitability = min;
        self
    }

    pub fn with_min_quality(mut self, min: i64) -> Self {
        self.min_quality = min;
        self
    }

    pub fn with_min_voice(mut self, min: i64) -> Self {
        self.min_voice = min;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_corpus(mut self, corpus: CorpusSettings) -> Self {
        self.corpus = corpus;
        self
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.min_suitability, 8);
        assert_eq!(config.min_quality, 4);
        assert_eq!(config.min_voice, 3);
        assert_eq!(config.templates.profiling, "paper_profiling");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.corpus.max_per_group, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_database_path("/tmp/x.db")
            .with_artifact_root("/tmp/artifacts")
            .with_min_suitability(6)
            .with_min_quality(2)
            .with_min_voice(1)
            .with_model("gpt-4o-mini")
            .with_temperature(0.2)
            .with_batch_limit(50);

        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.min_suitability, 6);
        assert_eq!(config.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(config.batch_limit, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let yaml = r#"
min_quality: 3
artifact_root: /data/artifacts
templates:
  critique: my_critique
retry:
  max_attempts: 5
corpus:
  dedup_scope: category
  max_per_group: 2
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.min_quality, 3);
        assert_eq!(config.min_suitability, 8);
        assert_eq!(config.artifact_root, PathBuf::from("/data/artifacts"));
        assert_eq!(config.templates.critique, "my_critique");
        assert_eq!(config.templates.refinement, "cot_refinement");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 1000);
        assert_eq!(config.corpus.dedup_scope, DedupScope::Category);
        assert_eq!(config.corpus.max_per_group, 2);
    }

    #[test]
    fn test_yaml_file_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "min_voice: 2\n").unwrap();
        assert_eq!(PipelineConfig::from_yaml_file(&path).unwrap().min_voice, 2);

        std::fs::write(&path, "min_voice: [not, a, number]\n").unwrap();
        assert!(matches!(
            PipelineConfig::from_yaml_file(&path),
            Err(ConfigError::Yaml(_))
        ));
        assert!(matches!(
            PipelineConfig::from_yaml_file(dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
        assert_eq!(
            PipelineConfig::from_yaml_str("  \n").unwrap(),
            PipelineConfig::default()
        );
    }

    #[test]
    fn test_env_overlay() {
        let config = PipelineConfig::default()
            .apply_env_from(lookup_from(&[
                ("PAPER_COT_DATABASE", "/var/lib/cot.db"),
                ("PAPER_COT_MIN_QUALITY", "2"),
                ("PAPER_COT_MAX_ATTEMPTS", "7"),
                ("PAPER_COT_DEDUP_SCOPE", "category"),
                ("PAPER_COT_FORMAT", "chat"),
            ]))
            .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/cot.db"));
        assert_eq!(config.min_quality, 2);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.corpus.dedup_scope, DedupScope::Category);
        assert_eq!(config.corpus.format, CorpusFormat::Chat);
    }

    #[test]
    fn test_env_invalid_value() {
        let err = PipelineConfig::default()
            .apply_env_from(lookup_from(&[("PAPER_COT_MIN_VOICE", "three")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, message } => {
                assert_eq!(key, "PAPER_COT_MIN_VOICE");
                assert!(message.contains("three"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validation_negative_threshold() {
        let result = PipelineConfig::default().with_min_quality(-1).validate();
        assert!(result.unwrap_err().to_string().contains("min_quality"));
    }

    #[test]
    fn test_validation_invalid_temperature() {
        let result = PipelineConfig::default().with_temperature(3.0).validate();
        assert!(result.unwrap_err().to_string().contains("temperature"));
    }

    #[test]
    fn test_validation_retry_and_batch() {
        let config = PipelineConfig::default().with_retry(RetryPolicy::default().with_max_attempts(0));
        assert!(config.validate().unwrap_err().to_string().contains("max_attempts"));

        let config = PipelineConfig::default().with_batch_limit(0);
        assert!(config.validate().unwrap_err().to_string().contains("batch_limit"));
    }

    #[test]
    fn test_validation_bad_rubric() {
        let mut config = PipelineConfig::default();
        config.rubrics.quality.required.push("novelty".to_string());
        assert!(config.validate().unwrap_err().to_string().contains("novelty"));
    }

    #[test]
    fn test_stage_config_thresholds() {
        let config = PipelineConfig::default().with_min_suitability(5);
        assert_eq!(config.stage_config(Stage::Extract).unwrap().min_score, Some(5));
        assert_eq!(config.stage_config(Stage::Voice).unwrap().min_score, Some(4));
        assert_eq!(config.stage_config(Stage::Critique).unwrap().min_score, None);
    }

    #[test]
    fn test_template_names() {
        let names = TemplateNames::default();
        assert_eq!(names.for_stage(Stage::Refine), Some("cot_refinement"));
        assert_eq!(names.for_stage(Stage::ScoreQuality), None);
        assert_eq!(names.all().len(), 7);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "PAPER_COT_MIN_VOICE".to_string(),
            message: "not a number".to_string(),
        };
        assert!(err.to_string().contains("PAPER_COT_MIN_VOICE"));

        let err = ConfigError::UnknownStage("polish".to_string());
        assert!(err.to_string().contains("polish"));
    }
}
