//! LLM integration for paper-cot-forge.
//!
//! - [`LiteLlmClient`] talks to any OpenAI-compatible `/chat/completions`
//!   endpoint.
//! - [`TemplateInvoker`] renders a named prompt template and sends it through
//!   an [`LlmProvider`]; it is the default model collaborator of the pipeline.
//!
//! ```ignore
//! use paper_cot_forge::llm::{LiteLlmClient, TemplateInvoker};
//! use std::sync::Arc;
//!
//! let client = Arc::new(LiteLlmClient::from_env()?);
//! let invoker = TemplateInvoker::from_dir("./templates", client)?
//!     .with_temperature(0.7);
//! ```

pub mod invoker;
pub mod litellm;

pub use invoker::TemplateInvoker;
pub use litellm::{GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message};
