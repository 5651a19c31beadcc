//! Error types for the collaborator boundaries.
//!
//! Defines the error types shared by the default collaborators:
//! - LLM API interactions
//! - Templated model invocation
//! - Document text extraction
//! - Document sources
//! - Rubric scoring
//!
//! Store, artifact, pipeline and corpus errors live next to their modules.

use thiserror::Error;

use crate::utils::tagged::TaggedSectionError;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    /// Connection, send or timeout failure before a response arrived.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Whether a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited(_) | LlmError::Transport(_) => true,
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 408 || *code == 429,
            _ => false,
        }
    }
}

/// Errors from rendering a prompt and invoking the model.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("Template '{0}' not found")]
    UnknownTemplate(String),

    #[error("Tera template rendering error: {0}")]
    Template(#[from] tera::Error),

    #[error("Failed to load template '{path}': {message}")]
    TemplateLoad { path: String, message: String },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Model call timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Model returned an empty response")]
    EmptyResponse,
}

impl InvocationError {
    /// Timeouts, rate limits, transport failures and retryable HTTP statuses.
    pub fn is_transient(&self) -> bool {
        match self {
            InvocationError::Timeout { .. } => true,
            InvocationError::Llm(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Errors that can occur while reading a document's text.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document '{0}' contains no text")]
    Empty(String),

    #[error("Document '{locator}' is not valid UTF-8 text")]
    NotText { locator: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while listing candidate documents.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Invalid document entry on line {line}: {message}")]
    InvalidEntry { line: usize, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while scoring structured assessment text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScoreError {
    #[error("Malformed assessment: {0}")]
    Malformed(#[from] TaggedSectionError),

    #[error("Missing rubric criterion '{0}'")]
    MissingCriterion(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_llm_errors() {
        assert!(LlmError::RateLimited("slow down".into()).is_transient());
        assert!(LlmError::Transport("error sending request".into()).is_transient());
        assert!(LlmError::ApiError {
            code: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(LlmError::ApiError {
            code: 408,
            message: "timeout".into()
        }
        .is_transient());

        assert!(!LlmError::ApiError {
            code: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!LlmError::ParseError("eof".into()).is_transient());
        assert!(!LlmError::RequestFailed("builder error".into()).is_transient());
        assert!(!LlmError::MissingApiBase.is_transient());
    }

    #[test]
    fn test_transient_invocation_errors() {
        assert!(InvocationError::Timeout { millis: 5000 }.is_transient());
        assert!(InvocationError::Llm(LlmError::RateLimited("x".into())).is_transient());
        assert!(!InvocationError::EmptyResponse.is_transient());
        assert!(!InvocationError::UnknownTemplate("cot_critique".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = ScoreError::MissingCriterion("clear_question".into());
        assert!(err.to_string().contains("clear_question"));

        let err = ExtractionError::Empty("paper.txt".into());
        assert!(err.to_string().contains("paper.txt"));
    }
}
