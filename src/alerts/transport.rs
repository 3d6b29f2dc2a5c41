//! Alert dispatch transports. Each is a fire-and-forget sender; a failed
//! send is logged by the scheduler and never blocks the other transports.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{PipelineError, Result};

/// One new-instance notification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMessage {
    pub strategy_id: i64,
    pub user_id: i64,
    pub strategy_name: String,
    pub ticker: String,
    pub timestamp_ms: i64,
    pub instance_key: String,
    pub text: String,
}

#[async_trait]
pub trait AlertTransport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, alert: &AlertMessage) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Telegram
// ---------------------------------------------------------------------------

pub struct TelegramTransport {
    client: reqwest::Client,
    token: String,
    chat_id: String,
}

impl TelegramTransport {
    pub fn new(token: String, chat_id: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| PipelineError::Transport(format!("telegram client: {e}")))?;
        Ok(Self {
            client,
            token,
            chat_id,
        })
    }
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[async_trait]
impl AlertTransport for TelegramTransport {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, alert: &AlertMessage) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let response = self
            .client
            .post(&url)
            .json(&SendMessageRequest {
                chat_id: &self.chat_id,
                text: &alert.text,
            })
            .send()
            .await
            .map_err(|e| PipelineError::Transport(format!("telegram send: {e}")))?;
        if !response.status().is_success() {
            return Err(PipelineError::Transport(format!(
                "telegram returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WebSocket broadcast
// ---------------------------------------------------------------------------

/// Process-local fan-out to connected WebSocket sessions. Having no
/// subscribers is not a failure.
pub struct BroadcastTransport {
    sender: tokio::sync::broadcast::Sender<String>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl AlertTransport for BroadcastTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn send(&self, alert: &AlertMessage) -> Result<()> {
        let payload = serde_json::to_string(alert)
            .map_err(|e| PipelineError::Transport(format!("alert serialization: {e}")))?;
        if self.sender.send(payload).is_err() {
            tracing::debug!(strategy_id = alert.strategy_id, "no websocket subscribers");
        }
        Ok(())
    }
}
