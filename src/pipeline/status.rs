//! Closed status vocabulary for documents and CoT sets.
//!
//! Every status string persisted in the record store round-trips through
//! [`Status`]. A value outside this enum is treated as store corruption rather
//! than silently passed along.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which table a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Document,
    CotSet,
}

impl Subject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::Document => "document",
            Subject::CotSet => "cot_set",
        }
    }

    /// Name of the backing table.
    pub(crate) fn table(&self) -> &'static str {
        match self {
            Subject::Document => "documents",
            Subject::CotSet => "cot_sets",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subject {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" | "doc" => Ok(Subject::Document),
            "cot_set" | "cot" | "cot-set" => Ok(Subject::CotSet),
            other => Err(format!("unknown record subject '{}'", other)),
        }
    }
}

/// Identity of a single record: subject plus integer primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub subject: Subject,
    pub id: i64,
}

impl RecordId {
    pub fn document(id: i64) -> Self {
        Self {
            subject: Subject::Document,
            id,
        }
    }

    pub fn cot_set(id: i64) -> Self {
        Self {
            subject: Subject::CotSet,
            id,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject, self.id)
    }
}

impl FromStr for RecordId {
    type Err = String;

    /// Parses `document:12` / `cot_set:4`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (subject, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <subject>:<id>, got '{}'", s))?;
        let subject: Subject = subject.trim().parse()?;
        let id: i64 = id
            .trim()
            .parse()
            .map_err(|_| format!("invalid record id '{}'", id))?;
        Ok(Self { subject, id })
    }
}

/// Processing status of a document or CoT set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    // Documents
    Pending,
    Profiled,
    ProfileScored,
    CotExtracted,
    FailedProfiling,
    FailedProfileScoring,
    FailedCotExtraction,

    // CoT sets
    Extracted,
    Critiqued,
    Refined,
    QualityAssessed,
    QualityScored,
    Voiced,
    VoicingAssessed,
    VoicingScored,
    FailedCritique,
    FailedRefinement,
    FailedQualityAssessment,
    FailedQualityScoring,
    FailedVoicing,
    FailedVoicingAssessment,
    FailedVoicingScoring,
}

impl Status {
    /// Every status, documents first.
    pub const ALL: [Status; 22] = [
        Status::Pending,
        Status::Profiled,
        Status::ProfileScored,
        Status::CotExtracted,
        Status::FailedProfiling,
        Status::FailedProfileScoring,
        Status::FailedCotExtraction,
        Status::Extracted,
        Status::Critiqued,
        Status::Refined,
        Status::QualityAssessed,
        Status::QualityScored,
        Status::Voiced,
        Status::VoicingAssessed,
        Status::VoicingScored,
        Status::FailedCritique,
        Status::FailedRefinement,
        Status::FailedQualityAssessment,
        Status::FailedQualityScoring,
        Status::FailedVoicing,
        Status::FailedVoicingAssessment,
        Status::FailedVoicingScoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Profiled => "profiled",
            Status::ProfileScored => "profile_scored",
            Status::CotExtracted => "cot_extracted",
            Status::FailedProfiling => "failed_profiling",
            Status::FailedProfileScoring => "failed_profile_scoring",
            Status::FailedCotExtraction => "failed_cot_extraction",
            Status::Extracted => "extracted",
            Status::Critiqued => "critiqued",
            Status::Refined => "refined",
            Status::QualityAssessed => "quality_assessed",
            Status::QualityScored => "quality_scored",
            Status::Voiced => "voiced",
            Status::VoicingAssessed => "voicing_assessed",
            Status::VoicingScored => "voicing_scored",
            Status::FailedCritique => "failed_critique",
            Status::FailedRefinement => "failed_refinement",
            Status::FailedQualityAssessment => "failed_quality_assessment",
            Status::FailedQualityScoring => "failed_quality_scoring",
            Status::FailedVoicing => "failed_voicing",
            Status::FailedVoicingAssessment => "failed_voicing_assessment",
            Status::FailedVoicingScoring => "failed_voicing_scoring",
        }
    }

    /// Which record type can hold this status.
    pub fn subject(&self) -> Subject {
        match self {
            Status::Pending
            | Status::Profiled
            | Status::ProfileScored
            | Status::CotExtracted
            | Status::FailedProfiling
            | Status::FailedProfileScoring
            | Status::FailedCotExtraction => Subject::Document,
            _ => Subject::CotSet,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.as_str().starts_with("failed_")
    }

    /// No stage consumes this status.
    pub fn is_terminal(&self) -> bool {
        self.is_failure() || matches!(self, Status::CotExtracted | Status::VoicingScored)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown processing status '{}'", s))
    }
}

/// Integer score columns written by scoring stages and read by gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreField {
    Suitability,
    Quality,
    Voice,
}

impl ScoreField {
    pub fn column(&self) -> &'static str {
        match self {
            ScoreField::Suitability => "suitability_score",
            ScoreField::Quality => "quality_score",
            ScoreField::Voice => "voice_score",
        }
    }

    pub fn subject(&self) -> Subject {
        match self {
            ScoreField::Suitability => Subject::Document,
            ScoreField::Quality | ScoreField::Voice => Subject::CotSet,
        }
    }
}

impl fmt::Display for ScoreField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Artifact reference columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSlot {
    Profile,
    DocumentExtraction,
    Extraction,
    Critique,
    Refinement,
    QualityAssessment,
    Voicing,
    VoicingAssessment,
}

impl ArtifactSlot {
    pub fn column(&self) -> &'static str {
        match self {
            ArtifactSlot::Profile => "profile_artifact",
            ArtifactSlot::DocumentExtraction | ArtifactSlot::Extraction => "extraction_artifact",
            ArtifactSlot::Critique => "critique_artifact",
            ArtifactSlot::Refinement => "refinement_artifact",
            ArtifactSlot::QualityAssessment => "quality_assessment_artifact",
            ArtifactSlot::Voicing => "voicing_artifact",
            ArtifactSlot::VoicingAssessment => "voicing_assessment_artifact",
        }
    }

    pub fn subject(&self) -> Subject {
        match self {
            ArtifactSlot::Profile | ArtifactSlot::DocumentExtraction => Subject::Document,
            _ => Subject::CotSet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in Status::ALL {
            let parsed: Status = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        let err = "ready_to_clean".parse::<Status>().unwrap_err();
        assert!(err.contains("ready_to_clean"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(Status::CotExtracted.is_terminal());
        assert!(Status::VoicingScored.is_terminal());
        assert!(Status::FailedVoicing.is_terminal());
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::QualityScored.is_terminal());
    }

    #[test]
    fn test_subjects() {
        assert_eq!(Status::Pending.subject(), Subject::Document);
        assert_eq!(Status::FailedCotExtraction.subject(), Subject::Document);
        assert_eq!(Status::Extracted.subject(), Subject::CotSet);
        assert_eq!(Status::FailedVoicingScoring.subject(), Subject::CotSet);
    }

    #[test]
    fn test_record_id_parse() {
        let id: RecordId = "document:12".parse().unwrap();
        assert_eq!(id, RecordId::document(12));
        let id: RecordId = "cot_set:3".parse().unwrap();
        assert_eq!(id, RecordId::cot_set(3));
        assert_eq!(RecordId::cot_set(3).to_string(), "cot_set:3");
        assert!("paper:1".parse::<RecordId>().is_err());
        assert!("document".parse::<RecordId>().is_err());
    }
}
