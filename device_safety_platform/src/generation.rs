//! Narrative text generation through an OpenAI-compatible chat endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::settings::GenerationConfig;

const SYSTEM_PROMPT: &str = "You are a medical device safety analyst. Write a concise, \
factual briefing for a clinician based only on the data provided. Do not speculate \
beyond the data and say so when the data is thin.";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("No generation API key configured")]
    NotConfigured,

    #[error("Generation endpoint answered {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Generation request failed: {0}")]
    Transport(String),

    #[error("Generation endpoint returned no text")]
    EmptyResponse,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Model identifier reported alongside generated text
    fn model(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatCompletionsClient {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl ChatCompletionsClient {
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionsClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, prompt), fields(model = %self.model, prompt_len = prompt.len()))]
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let api_key = self.api_key.as_deref().ok_or(GenerationError::NotConfigured)?;

        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(GenerationError::EmptyResponse)?;

        debug!(chars = text.len(), "Generated narrative");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(api_base: &str, api_key: Option<&str>) -> GenerationConfig {
        GenerationConfig {
            api_base: api_base.to_string(),
            api_key: api_key.map(str::to_string),
            model: "test-model".to_string(),
            ..GenerationConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_reported_without_a_request() {
        let client = ChatCompletionsClient::new(&config("http://127.0.0.1:9", None)).unwrap();
        let err = client.generate("hello").await.unwrap_err();
        assert!(matches!(err, GenerationError::NotConfigured));
    }

    #[tokio::test]
    async fn test_generate_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [ { "message": { "role": "assistant", "content": "  Summary text.\n" } } ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatCompletionsClient::new(&config(&server.uri(), Some("secret"))).unwrap();
        assert_eq!(client.generate("prompt").await.unwrap(), "Summary text.");
        assert_eq!(client.model(), "test-model");
    }

    #[tokio::test]
    async fn test_http_errors_surface_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = ChatCompletionsClient::new(&config(&server.uri(), Some("secret"))).unwrap();
        let err = client.generate("prompt").await.unwrap_err();
        assert!(matches!(err, GenerationError::Http { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_empty_choices_are_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })))
            .mount(&server)
            .await;

        let client = ChatCompletionsClient::new(&config(&server.uri(), Some("secret"))).unwrap();
        let err = client.generate("prompt").await.unwrap_err();
        assert!(matches!(err, GenerationError::EmptyResponse));
    }
}
