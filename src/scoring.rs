//! Rubric scoring of model assessments.
//!
//! An assessment answers each rubric criterion with a tag inside its
//! `<results>` block. `yes`/`y` counts one point, anything else zero. When a
//! required criterion scores zero the whole assessment scores zero.

use serde::{Deserialize, Serialize};

use crate::collaborators::ScoreParser;
use crate::error::ScoreError;
use crate::utils::tagged::{extract_results, extract_tag};

/// Named yes/no criteria, some of which are mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rubric {
    pub name: String,
    pub criteria: Vec<String>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl Rubric {
    pub fn new(name: impl Into<String>, criteria: &[&str], required: &[&str]) -> Self {
        Self {
            name: name.into(),
            criteria: criteria.iter().map(|c| c.to_string()).collect(),
            required: required.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Rubric for paper suitability profiles.
    pub fn profiling() -> Self {
        Self::new(
            "profiling",
            &[
                "clear_question",
                "definitive_answer",
                "complex_reasoning",
                "coherent_structure",
                "layperson_comprehensible",
                "minimal_jargon",
                "illustrative_examples",
                "significant_insights",
                "verifiable_steps",
                "overall_suitability",
            ],
            &["clear_question", "definitive_answer", "complex_reasoning"],
        )
    }

    /// Rubric for CoT quality assessments.
    pub fn quality() -> Self {
        Self::new(
            "quality",
            &[
                "source_fidelity",
                "reasoning_integrity",
                "training_utility",
                "structural_quality",
            ],
            &["source_fidelity", "reasoning_integrity"],
        )
    }

    /// Rubric for voicing assessments.
    pub fn voicing() -> Self {
        Self::new(
            "voicing",
            &["content_preservation", "factual_accuracy", "voice_requirements"],
            &["content_preservation", "factual_accuracy"],
        )
    }

    pub fn max_score(&self) -> i64 {
        self.criteria.len() as i64
    }

    /// Checks that the rubric is usable; returns a message on failure.
    pub fn check(&self) -> Result<(), String> {
        if self.criteria.is_empty() {
            return Err(format!("rubric '{}' has no criteria", self.name));
        }
        if let Some(missing) = self
            .required
            .iter()
            .find(|r| !self.criteria.contains(r))
        {
            return Err(format!(
                "rubric '{}' requires unknown criterion '{}'",
                self.name, missing
            ));
        }
        Ok(())
    }
}

/// [`ScoreParser`] that applies a [`Rubric`].
#[derive(Debug, Clone)]
pub struct RubricScorer {
    rubric: Rubric,
}

impl RubricScorer {
    pub fn new(rubric: Rubric) -> Self {
        Self { rubric }
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }
}

fn is_affirmative(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "yes" | "y")
}

impl ScoreParser for RubricScorer {
    fn parse_score(&self, structured_text: &str) -> Result<i64, ScoreError> {
        let section = extract_results(structured_text)?;

        let mut total = 0;
        let mut required_failed = false;
        for criterion in &self.rubric.criteria {
            let value = extract_tag(section, criterion)
                .ok_or_else(|| ScoreError::MissingCriterion(criterion.clone()))?;
            if is_affirmative(&value) {
                total += 1;
            } else if self.rubric.required.contains(criterion) {
                required_failed = true;
            }
        }

        if required_failed {
            tracing::debug!(rubric = %self.rubric.name, "Required criterion not met");
            return Ok(0);
        }
        Ok(total)
    }
}
