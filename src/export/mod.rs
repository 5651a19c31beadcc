//! Export of finished CoT sets as a training corpus.

pub mod corpus;

pub use corpus::{
    CompileError, CompileReport, CorpusCompiler, CorpusEntry, CorpusFormat, CorpusSettings,
    DedupScope, Provenance,
};
