//! Stage gate: the fixed stage table and the pure eligibility rules over it.
//!
//! The table maps each consuming status to exactly one stage together with
//! its success and failure statuses and, for gated stages, the score field
//! that must meet the configured threshold. The record store consults
//! [`is_legal_transition`] on every commit, so nothing outside this table can
//! ever be persisted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::ConfigError;
use super::status::{ArtifactSlot, ScoreField, Status, Subject};
use crate::storage::records::RecordSnapshot;

/// Errors from gate decisions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    /// Record is not at the stage's input status.
    #[error("stage '{stage}' expects status '{expected}', record is '{actual}'")]
    WrongStatus {
        stage: Stage,
        expected: Status,
        actual: Status,
    },

    /// Record belongs to the other table.
    #[error("stage '{stage}' operates on {expected} records, got a {actual}")]
    WrongSubject {
        stage: Stage,
        expected: Subject,
        actual: Subject,
    },
}

/// One named step of the fixed processing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Profile,
    ScoreProfile,
    Extract,
    Critique,
    Refine,
    AssessQuality,
    ScoreQuality,
    Voice,
    AssessVoicing,
    ScoreVoicing,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 10] = [
        Stage::Profile,
        Stage::ScoreProfile,
        Stage::Extract,
        Stage::Critique,
        Stage::Refine,
        Stage::AssessQuality,
        Stage::ScoreQuality,
        Stage::Voice,
        Stage::AssessVoicing,
        Stage::ScoreVoicing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Profile => "profile",
            Stage::ScoreProfile => "score_profile",
            Stage::Extract => "extract",
            Stage::Critique => "critique",
            Stage::Refine => "refine",
            Stage::AssessQuality => "assess_quality",
            Stage::ScoreQuality => "score_quality",
            Stage::Voice => "voice",
            Stage::AssessVoicing => "assess_voicing",
            Stage::ScoreVoicing => "score_voicing",
        }
    }

    /// Table row for this stage.
    pub fn rule(&self) -> &'static StageRule {
        // STAGE_TABLE is laid out in Stage::ALL order.
        &STAGE_TABLE[*self as usize]
    }

    pub fn subject(&self) -> Subject {
        self.rule().subject
    }

    /// Stage that follows on success, if any.
    pub fn next(&self) -> Option<Stage> {
        stage_for_status(self.rule().success).map(|rule| rule.stage)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| ConfigError::UnknownStage(s.to_string()))
    }
}

/// Whether a stage calls the model or only parses a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// One model invocation, one artifact per transition.
    Invoke,
    /// Pure score parse over an upstream artifact; no new artifact.
    Score,
}

/// One row of the stage table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRule {
    pub stage: Stage,
    pub subject: Subject,
    pub input: Status,
    pub success: Status,
    pub failure: Status,
    pub kind: StageKind,
    /// Score that must meet the configured minimum before entering.
    pub gate: Option<ScoreField>,
    /// Score column written on success.
    pub writes: Option<ScoreField>,
    /// Artifact column set on success.
    pub artifact: Option<ArtifactSlot>,
}

/// The fixed stage ordering.
pub static STAGE_TABLE: [StageRule; 10] = [
    StageRule {
        stage: Stage::Profile,
        subject: Subject::Document,
        input: Status::Pending,
        success: Status::Profiled,
        failure: Status::FailedProfiling,
        kind: StageKind::Invoke,
        gate: None,
        writes: None,
        artifact: Some(ArtifactSlot::Profile),
    },
    StageRule {
        stage: Stage::ScoreProfile,
        subject: Subject::Document,
        input: Status::Profiled,
        success: Status::ProfileScored,
        failure: Status::FailedProfileScoring,
        kind: StageKind::Score,
        gate: None,
        writes: Some(ScoreField::Suitability),
        artifact: None,
    },
    StageRule {
        stage: Stage::Extract,
        subject: Subject::Document,
        input: Status::ProfileScored,
        success: Status::CotExtracted,
        failure: Status::FailedCotExtraction,
        kind: StageKind::Invoke,
        gate: Some(ScoreField::Suitability),
        writes: None,
        artifact: Some(ArtifactSlot::DocumentExtraction),
    },
    StageRule {
        stage: Stage::Critique,
        subject: Subject::CotSet,
        input: Status::Extracted,
        success: Status::Critiqued,
        failure: Status::FailedCritique,
        kind: StageKind::Invoke,
        gate: None,
        writes: None,
        artifact: Some(ArtifactSlot::Critique),
    },
    StageRule {
        stage: Stage::Refine,
        subject: Subject::CotSet,
        input: Status::Critiqued,
        success: Status::Refined,
        failure: Status::FailedRefinement,
        kind: StageKind::Invoke,
        gate: None,
        writes: None,
        artifact: Some(ArtifactSlot::Refinement),
    },
    StageRule {
        stage: Stage::AssessQuality,
        subject: Subject::CotSet,
        input: Status::Refined,
        success: Status::QualityAssessed,
        failure: Status::FailedQualityAssessment,
        kind: StageKind::Invoke,
        gate: None,
        writes: None,
        artifact: Some(ArtifactSlot::QualityAssessment),
    },
    StageRule {
        stage: Stage::ScoreQuality,
        subject: Subject::CotSet,
        input: Status::QualityAssessed,
        success: Status::QualityScored,
        failure: Status::FailedQualityScoring,
        kind: StageKind::Score,
        gate: None,
        writes: Some(ScoreField::Quality),
        artifact: None,
    },
    StageRule {
        stage: Stage::Voice,
        subject: Subject::CotSet,
        input: Status::QualityScored,
        success: Status::Voiced,
        failure: Status::FailedVoicing,
        kind: StageKind::Invoke,
        gate: Some(ScoreField::Quality),
        writes: None,
        artifact: Some(ArtifactSlot::Voicing),
    },
    StageRule {
        stage: Stage::AssessVoicing,
        subject: Subject::CotSet,
        input: Status::Voiced,
        success: Status::VoicingAssessed,
        failure: Status::FailedVoicingAssessment,
        kind: StageKind::Invoke,
        gate: None,
        writes: None,
        artifact: Some(ArtifactSlot::VoicingAssessment),
    },
    StageRule {
        stage: Stage::ScoreVoicing,
        subject: Subject::CotSet,
        input: Status::VoicingAssessed,
        success: Status::VoicingScored,
        failure: Status::FailedVoicingScoring,
        kind: StageKind::Score,
        gate: None,
        writes: Some(ScoreField::Voice),
        artifact: None,
    },
];

/// Finds the stage that consumes `status`.
pub fn stage_for_status(status: Status) -> Option<&'static StageRule> {
    STAGE_TABLE.iter().find(|rule| rule.input == status)
}

/// True when `from -> to` is a row of the stage table.
pub fn is_legal_transition(from: Status, to: Status) -> bool {
    stage_for_status(from)
        .map(|rule| rule.success == to || rule.failure == to)
        .unwrap_or(false)
}

/// Effective settings for one stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageConfig {
    pub stage: Stage,
    /// Threshold for gated stages; ignored for ungated ones.
    pub min_score: Option<i64>,
}

impl StageConfig {
    /// Builds a stage config, requiring a threshold exactly when the stage is gated.
    pub fn new(stage: Stage, min_score: Option<i64>) -> Result<Self, ConfigError> {
        if stage.rule().gate.is_some() && min_score.is_none() {
            return Err(ConfigError::ValidationFailed(format!(
                "stage '{}' is score-gated and needs a minimum score",
                stage
            )));
        }
        Ok(Self { stage, min_score })
    }

    pub fn rule(&self) -> &'static StageRule {
        self.stage.rule()
    }
}

/// Outcome class used to pick the next status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Failure,
}

/// Whether `record` may enter the configured stage right now.
pub fn is_eligible(record: &RecordSnapshot, config: &StageConfig) -> bool {
    let rule = config.rule();
    if record.id().subject != rule.subject || record.status() != rule.input {
        return false;
    }
    match (rule.gate, config.min_score) {
        (Some(field), Some(min)) => record.score(field).map(|s| s >= min).unwrap_or(false),
        (Some(_), None) => false,
        (None, _) => true,
    }
}

/// Status the record moves to after the stage finishes with `outcome`.
pub fn next_status(
    record: &RecordSnapshot,
    config: &StageConfig,
    outcome: OutcomeKind,
) -> Result<Status, GateError> {
    let rule = config.rule();
    if record.id().subject != rule.subject {
        return Err(GateError::WrongSubject {
            stage: rule.stage,
            expected: rule.subject,
            actual: record.id().subject,
        });
    }
    if record.status() != rule.input {
        return Err(GateError::WrongStatus {
            stage: rule.stage,
            expected: rule.input,
            actual: record.status(),
        });
    }
    Ok(match outcome {
        OutcomeKind::Success => rule.success,
        OutcomeKind::Failure => rule.failure,
    })
}

/// Batch ordering when several records are eligible.
///
/// There is intentionally no `Default`: callers pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderBy {
    /// Ascending record id; reproducible.
    Identity,
    /// SQLite `RANDOM()`.
    Random,
    /// Round-robin across primary categories, random within each.
    CategoryBalanced,
}

impl OrderBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderBy::Identity => "identity",
            OrderBy::Random => "random",
            OrderBy::CategoryBalanced => "category-balanced",
        }
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderBy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "identity" | "id" => Ok(OrderBy::Identity),
            "random" => Ok(OrderBy::Random),
            "category-balanced" | "balanced" => Ok(OrderBy::CategoryBalanced),
            other => Err(ConfigError::InvalidValue {
                key: "order_by".to_string(),
                message: format!(
                    "expected identity, random or category-balanced, got '{}'",
                    other
                ),
            }),
        }
    }
}
