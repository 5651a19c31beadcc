//! paper-cot-forge: turns research papers into chain-of-thought training data.
//!
//! Papers move through a fixed sequence of model-driven stages recorded in a
//! SQLite store. Every model response is kept as an immutable artifact, and
//! finished chain-of-thought sets are compiled into a JSONL corpus.

// Core modules
pub mod cli;
pub mod collaborators;
pub mod error;
pub mod export;
pub mod llm;
pub mod pipeline;
pub mod scoring;
pub mod storage;
pub mod utils;

// Re-export commonly used error types
pub use error::{ExtractionError, InvocationError, LlmError, ScoreError, SourceError};
pub use export::CompileError;
pub use pipeline::{ConfigError, GateError, PipelineError};
pub use storage::{ArtifactError, StoreError};
