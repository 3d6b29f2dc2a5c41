//! Tiered result cache: a process-wide TTL key-value store shared by
//! backtest results and the synthesizer's conversation transcripts.
//!
//! Entries expire lazily: an expired entry is evicted on the read that
//! finds it. Writes for the same key are last-writer-wins, which is the
//! right answer for concurrent backtests of one strategy, since later
//! results reflect the latest spec.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backtest::BacktestResult;
use crate::error::{PipelineError, Result};

/// Backtest results live for a day unless rewritten.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Entry {
    value: String,
    expires_at_ms: i64,
}

pub struct TtlCache {
    entries: DashMap<String, Entry>,
    default_ttl: Duration,
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl TtlCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn backtest_key(user_id: i64, strategy_id: i64) -> String {
        format!("user:{user_id}:backtest:{strategy_id}:results")
    }

    pub fn conversation_key(user_id: i64, conversation_id: &str) -> String {
        format!("user:{user_id}:conversation:{conversation_id}")
    }

    pub fn put(&self, key: &str, value: String, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at_ms: Utc::now().timestamp_millis() + ttl.as_millis() as i64,
            },
        );
    }

    pub fn put_default_ttl(&self, key: &str, value: String) {
        self.put(key, value, self.default_ttl);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Utc::now().timestamp_millis();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at_ms > now {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        // Expired: evict outside the read guard.
        self.entries.remove(key);
        None
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    // -- Backtest results ---------------------------------------------------

    pub fn store_result(&self, user_id: i64, strategy_id: i64, result: &BacktestResult) -> Result<()> {
        let payload = serde_json::to_string(result)
            .map_err(|e| PipelineError::Transport(format!("cache serialization: {e}")))?;
        self.put_default_ttl(&Self::backtest_key(user_id, strategy_id), payload);
        Ok(())
    }

    /// Read a cached result, `CacheMiss` when absent or expired.
    pub fn load_result(&self, user_id: i64, strategy_id: i64) -> Result<BacktestResult> {
        let payload = self
            .get(&Self::backtest_key(user_id, strategy_id))
            .ok_or(PipelineError::CacheMiss(strategy_id))?;
        serde_json::from_str(&payload)
            .map_err(|e| PipelineError::Transport(format!("cache deserialization: {e}")))
    }

    // -- Conversation messages ---------------------------------------------

    /// Append a message carrying its own expiry to a conversation key.
    pub fn append_message(&self, key: &str, message: StoredMessage) -> Result<()> {
        let mut messages = self.load_messages(key)?;
        messages.push(message);
        let payload = serde_json::to_string(&messages)
            .map_err(|e| PipelineError::Transport(format!("cache serialization: {e}")))?;
        self.put_default_ttl(key, payload);
        Ok(())
    }

    /// Load a conversation, filtering messages past their deadline. The key
    /// is rewritten when any message survives and deleted when none do.
    pub fn load_messages(&self, key: &str) -> Result<Vec<StoredMessage>> {
        let Some(payload) = self.get(key) else {
            return Ok(Vec::new());
        };
        let messages: Vec<StoredMessage> = serde_json::from_str(&payload)
            .map_err(|e| PipelineError::Transport(format!("cache deserialization: {e}")))?;
        let now = Utc::now().timestamp_millis();
        let survivors: Vec<StoredMessage> = messages
            .into_iter()
            .filter(|m| m.expires_at_ms > now)
            .collect();

        if survivors.is_empty() {
            self.delete(key);
        } else {
            let rewritten = serde_json::to_string(&survivors)
                .map_err(|e| PipelineError::Transport(format!("cache serialization: {e}")))?;
            self.put_default_ttl(key, rewritten);
        }
        Ok(survivors)
    }
}

/// A conversation turn with its own expiry deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub expires_at_ms: i64,
}

impl StoredMessage {
    pub fn new(role: &str, content: &str, ttl: Duration) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            expires_at_ms: Utc::now().timestamp_millis() + ttl.as_millis() as i64,
        }
    }
}
