//! OpenAI-compatible chat client (LiteLLM proxy, OpenRouter, vLLM, ...).
//!
//! Only `/chat/completions` is used. Retry and timeouts per attempt are the
//! caller's concern; this client maps HTTP failures onto [`LlmError`] so the
//! caller can tell transient from permanent errors.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const HTTP_TIMEOUT: Duration = Duration::from_secs(600);

/// One chat turn sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: &'static str,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

/// A single chat completion call.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    /// `None` uses the provider's default model.
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// Text of the first choice plus accounting.
#[derive(Debug, Clone, Default)]
pub struct GenerationResponse {
    pub model: String,
    pub content: String,
    pub total_tokens: u32,
}

/// Anything that can answer a [`GenerationRequest`].
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// Client for OpenAI-compatible APIs.
pub struct LiteLlmClient {
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    http_client: Client,
}

impl LiteLlmClient {
    /// * `api_base` - Base URL, e.g. "http://localhost:4000" or "https://openrouter.ai/api/v1"
    /// * `api_key` - Optional bearer token
    pub fn new(api_base: &str, api_key: Option<String>, default_model: impl Into<String>) -> Self {
        let http_client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            http_client,
        }
    }

    /// Reads `LITELLM_API_BASE` (required), `LITELLM_API_KEY` and
    /// `LITELLM_DEFAULT_MODEL`.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_base = env::var("LITELLM_API_BASE").map_err(|_| LlmError::MissingApiBase)?;
        let api_key = env::var("LITELLM_API_KEY").ok().filter(|k| !k.is_empty());
        let default_model =
            env::var("LITELLM_DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self::new(&api_base, api_key, default_model))
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Maps a non-success HTTP status and body onto an [`LlmError`].
fn error_from_status(status_code: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());

    if status_code == 429 {
        return LlmError::RateLimited(message);
    }
    LlmError::ApiError {
        code: status_code,
        message,
    }
}

/// Connection, timeout and send failures are worth another attempt.
fn error_from_transport(err: reqwest::Error) -> LlmError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        LlmError::Transport(err.to_string())
    } else {
        LlmError::RequestFailed(err.to_string())
    }
}

fn reply_into_response(reply: ChatReply) -> GenerationResponse {
    GenerationResponse {
        model: reply.model,
        content: reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default(),
        total_tokens: reply.usage.map(|u| u.total_tokens).unwrap_or_default(),
    }
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let body = ChatBody {
            model: request.model.as_deref().unwrap_or(&self.default_model),
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut http_request = self
            .http_client
            .post(self.completions_url())
            .header("X-Title", "paper-cot-forge");
        if let Some(api_key) = &self.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        tracing::debug!(model = body.model, messages = body.messages.len(), "Sending chat completion");
        let http_response = http_request
            .json(&body)
            .send()
            .await
            .map_err(error_from_transport)?;

        let status = http_response.status();
        if !status.is_success() {
            let text = http_response.text().await.unwrap_or_default();
            return Err(error_from_status(status.as_u16(), &text));
        }

        let reply: ChatReply = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        Ok(reply_into_response(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_body_omits_unset_options() {
        let messages = vec![Message::user("test")];
        let body = ChatBody {
            model: "gpt-4",
            messages: &messages,
            temperature: Some(0.7),
            max_tokens: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["temperature"], 0.7);
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_reply_takes_first_choice() {
        let reply: ChatReply = serde_json::from_str(
            r#"{"model":"m","choices":[{"message":{"content":"one"}},{"message":{"content":"two"}}],
                "usage":{"total_tokens":12}}"#,
        )
        .unwrap();
        let response = reply_into_response(reply);
        assert_eq!(response.content, "one");
        assert_eq!(response.total_tokens, 12);

        let sparse: ChatReply =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        let response = reply_into_response(sparse);
        assert!(response.content.is_empty());
        assert_eq!(response.total_tokens, 0);
    }

    #[test]
    fn test_error_from_status() {
        let structured = r#"{"error":{"message":"slow down"}}"#;
        assert!(matches!(
            error_from_status(429, structured),
            LlmError::RateLimited(msg) if msg == "slow down"
        ));
        assert!(matches!(
            error_from_status(503, "upstream down"),
            LlmError::ApiError { code: 503, message } if message == "upstream down"
        ));
    }

    #[test]
    fn test_new_trims_base() {
        let client = LiteLlmClient::new("http://localhost:4000/", None, "gpt-4");
        assert_eq!(client.completions_url(), "http://localhost:4000/chat/completions");
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let client = LiteLlmClient::new("http://127.0.0.1:9", None, "gpt-4");
        let request = GenerationRequest {
            messages: vec![Message::user("test")],
            ..Default::default()
        };

        let err = client.generate(request).await.unwrap_err();
        assert!(matches!(err, LlmError::Transport(_)), "{:?}", err);
        assert!(err.is_transient());
    }
}
