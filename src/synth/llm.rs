//! Chat-model transport: a thin request/response client for the generative
//! model endpoint (OpenAI-compatible chat completions).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// The model is consumed as an opaque request/response endpoint; one turn
/// in, one completion out. Timeouts live in the client, retries live in the
/// synthesizer loop.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

pub struct HttpChatModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpChatModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Transport(format!("model client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::Transport(format!("model request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Transport(format!(
                "model returned {status}: {body}"
            )));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Transport(format!("model response: {e}")))?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| PipelineError::Transport("model returned no choices".to_string()))
    }
}
