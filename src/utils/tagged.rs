//! Parsing of tag-delimited model output.
//!
//! Models answer inside a `<results>...</results>` block containing named
//! tags, for example:
//!
//! ```text
//! <results>
//!   <question>Why does X happen?</question>
//!   <chain_of_reasoning>Step 1 ...</chain_of_reasoning>
//!   <answer>Because Y.</answer>
//! </results>
//! ```
//!
//! ```
//! use paper_cot_forge::utils::tagged::{extract_results, extract_tag};
//!
//! let text = "noise <results><answer> 42 </answer></results> noise";
//! let section = extract_results(text).unwrap();
//! assert_eq!(extract_tag(section, "answer").as_deref(), Some("42"));
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when structured output is malformed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaggedSectionError {
    #[error("No <results> block found in response")]
    MissingResults,

    #[error("Missing <{tag}> tag in response")]
    MissingTag { tag: String },

    #[error("Empty <{tag}> tag in response")]
    EmptyTag { tag: String },
}

/// Question, reasoning and answer read from one `<results>` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CotTriple {
    pub question: Option<String>,
    pub chain_of_reasoning: String,
    pub answer: String,
}

/// Reasoning and answer rewritten in the target voice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoicedCot {
    pub chain_of_reasoning: String,
    pub answer: String,
}

fn results_regex() -> Option<Regex> {
    Regex::new(r"(?s)<results>(.*?)</results>").ok()
}

/// Inner text of every `<results>` block, in order of appearance.
pub fn extract_all_results(text: &str) -> Vec<&str> {
    let Some(re) = results_regex() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

/// Inner text of the first `<results>` block.
pub fn extract_results(text: &str) -> Result<&str, TaggedSectionError> {
    results_regex()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or(TaggedSectionError::MissingResults)
}

/// Trimmed content of the first `<tag>...</tag>` in `section`.
pub fn extract_tag(section: &str, tag: &str) -> Option<String> {
    let escaped = regex::escape(tag);
    let re = Regex::new(&format!(r"(?s)<{0}>(.*?)</{0}>", escaped)).ok()?;
    re.captures(section)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Like [`extract_tag`] but a missing or blank tag is an error.
pub fn require_tag(section: &str, tag: &str) -> Result<String, TaggedSectionError> {
    match extract_tag(section, tag) {
        None => Err(TaggedSectionError::MissingTag {
            tag: tag.to_string(),
        }),
        Some(value) if value.is_empty() => Err(TaggedSectionError::EmptyTag {
            tag: tag.to_string(),
        }),
        Some(value) => Ok(value),
    }
}

/// Reads a CoT triple from the inside of a `<results>` block.
pub fn parse_cot(section: &str, require_question: bool) -> Result<CotTriple, TaggedSectionError> {
    let question = if require_question {
        Some(require_tag(section, "question")?)
    } else {
        extract_tag(section, "question").filter(|q| !q.is_empty())
    };

    Ok(CotTriple {
        question,
        chain_of_reasoning: require_tag(section, "chain_of_reasoning")?,
        answer: require_tag(section, "answer")?,
    })
}

/// Every CoT triple of an extraction response, one per `<results>` block.
pub fn parse_extraction(text: &str) -> Result<Vec<CotTriple>, TaggedSectionError> {
    let sections = extract_all_results(text);
    if sections.is_empty() {
        return Err(TaggedSectionError::MissingResults);
    }
    sections
        .into_iter()
        .map(|section| parse_cot(section, true))
        .collect()
}

/// Reads a voicing response; the rewritten fields live in `<content>`.
pub fn parse_voiced(text: &str) -> Result<VoicedCot, TaggedSectionError> {
    let section = extract_results(text)?;
    let content = extract_tag(section, "content").ok_or_else(|| TaggedSectionError::MissingTag {
        tag: "content".to_string(),
    })?;

    Ok(VoicedCot {
        chain_of_reasoning: require_tag(&content, "chain_of_reasoning")?,
        answer: require_tag(&content, "answer")?,
    })
}

/// Reads the `<critique>` tag, inside `<results>` when present.
pub fn parse_critique(text: &str) -> Result<String, TaggedSectionError> {
    let section = extract_results(text).unwrap_or(text);
    require_tag(section, "critique")
}
