//! Command-line interface for paper-cot-forge.
//!
//! Provides commands for ingesting papers, running stages, compiling the
//! corpus and inspecting pipeline state.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
