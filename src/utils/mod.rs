//! Shared utility functions for paper-cot-forge.
//!
//! Currently this is the parser for tag-delimited model output.

pub mod tagged;

pub use tagged::{
    extract_all_results, extract_results, extract_tag, parse_cot, parse_critique,
    parse_extraction, parse_voiced, require_tag, CotTriple, TaggedSectionError, VoicedCot,
};
