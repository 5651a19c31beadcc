//! Persistent storage for pipeline state.
//!
//! The storage system consists of:
//! - **Records**: SQLite store of documents and CoT sets, their statuses,
//!   scores and artifact references
//! - **Artifacts**: append-only text files holding every model response
//!
//! # Usage
//!
//! ```rust,ignore
//! use paper_cot_forge::storage::{ArtifactWriter, RecordStore, TransitionUpdate};
//!
//! let store = RecordStore::open("paper_cot.db").await?;
//! let artifacts = ArtifactWriter::new("./artifacts");
//!
//! let reference = artifacts.write(record, Stage::Profile, &metadata, &response).await?;
//! store
//!     .commit_transition(
//!         record,
//!         Status::Pending,
//!         Status::Profiled,
//!         &TransitionUpdate::new().with_artifact(ArtifactSlot::Profile, reference.as_str()),
//!     )
//!     .await?;
//! ```

pub mod artifacts;
pub mod records;

// Re-export main types for convenience
pub use artifacts::{Artifact, ArtifactError, ArtifactRef, ArtifactWriter};
pub use records::{
    CorpusCandidate, CotSetRecord, DocumentRecord, EligibleFilter, NewCotSet, RecordSnapshot,
    RecordStore, RegisterReport, StatusCounts, StoreError, TransitionUpdate,
};
