//! The paper to chain-of-thought processing pipeline.
//!
//! # Architecture
//!
//! - **Status**: the closed set of record statuses and record identities
//! - **Gate**: the fixed stage table and eligibility rules
//! - **Runner**: runs one stage on one record inside a failure boundary
//! - **Orchestrator**: batches records through the runner
//! - **Retry**: bounded retry of model calls
//! - **Config**: layered configuration for all of the above
//!
//! # Pipeline Flow
//!
//! Documents go `pending → profiled → profile_scored → cot_extracted`. The
//! extraction spawns one CoT set per candidate, and each set goes
//! `extracted → critiqued → refined → quality_assessed → quality_scored →
//! voiced → voicing_assessed → voicing_scored`. Every stage can instead move
//! a record to its own terminal `failed_*` status.
//!
//! # Example
//!
//! ```rust,ignore
//! use paper_cot_forge::pipeline::{BatchOrchestrator, OrderBy, PipelineConfig, Stage, StageRunner};
//!
//! let config = PipelineConfig::from_env()?;
//! let runner = StageRunner::new(store, artifacts, extractor, invoker, &config);
//! let orchestrator = BatchOrchestrator::new(runner, config);
//!
//! let result = orchestrator.run_stage(Stage::Profile, OrderBy::Identity, 10).await?;
//! println!("{} succeeded, {} failed", result.succeeded, result.failed);
//! ```

pub mod config;
pub mod gate;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod status;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig, Rubrics, TemplateNames};
pub use gate::{
    is_eligible, is_legal_transition, next_status, GateError, OrderBy, OutcomeKind, Stage,
    StageConfig, StageKind, StageRule, STAGE_TABLE,
};
pub use orchestrator::{BatchOrchestrator, BatchResult, PipelineError, PipelineReport};
pub use retry::RetryPolicy;
pub use runner::{Outcome, OutcomeStatus, Scorers, SkipReason, StageRunner};
pub use status::{ArtifactSlot, RecordId, ScoreField, Status, Subject};
