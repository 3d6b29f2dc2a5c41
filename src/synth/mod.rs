//! NL → spec synthesizer: a bounded self-repair loop around the chat model.
//!
//! Each attempt asks the model for a single `{name, spec}` JSON object,
//! extracts the outermost JSON block, deserializes and validates it. A
//! failure at any of those steps becomes a user turn carrying the offending
//! text plus the diagnostic, and the loop retries. Validation diagnostics
//! are path-ordered, so the model gets stable targets to fix.

pub mod llm;
pub mod prompt;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cache::{StoredMessage, TtlCache};
use crate::error::{PipelineError, Result};
use crate::spec::{validate, StrategySpec};
use crate::store::StrategyStore;
use crate::vocab::Vocabulary;

use llm::{ChatMessage, ChatModel};

/// Conversation transcripts outlive a single call but not a workday.
const MESSAGE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(serde::Deserialize)]
struct NamedSpec {
    name: String,
    spec: StrategySpec,
}

pub struct Synthesizer {
    model: Arc<dyn ChatModel>,
    vocab: Arc<Vocabulary>,
    store: Arc<StrategyStore>,
    cache: Arc<TtlCache>,
    max_attempts: usize,
}

impl Synthesizer {
    pub fn new(
        model: Arc<dyn ChatModel>,
        vocab: Arc<Vocabulary>,
        store: Arc<StrategyStore>,
        cache: Arc<TtlCache>,
        max_attempts: usize,
    ) -> Self {
        Self {
            model,
            vocab,
            store,
            cache,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Synthesize, validate, and persist a strategy from a natural-language
    /// query. `overwrite_id` updates an existing strategy in place; `None`
    /// creates a new one.
    pub async fn synthesize(
        &self,
        user_id: i64,
        nl_query: &str,
        overwrite_id: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<(i64, String)> {
        let system = prompt::render(&self.vocab.snapshot());
        let mut conversation = vec![ChatMessage::system(system), ChatMessage::user(nl_query)];

        let conversation_key =
            TtlCache::conversation_key(user_id, &uuid::Uuid::new_v4().to_string());
        self.persist_turn(&conversation_key, "user", nl_query);

        let mut last_diagnostic = String::new();
        let mut last_response = String::new();

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let response = tokio::select! {
                () = cancel.cancelled() => return Err(PipelineError::Cancelled),
                completion = self.model.complete(&conversation) => completion?,
            };
            self.persist_turn(&conversation_key, "assistant", &response);
            last_response.clone_from(&response);

            match self.try_accept(&response) {
                Ok((name, spec)) => {
                    let strategy_id = match overwrite_id {
                        Some(id) => {
                            self.store
                                .update(user_id, id, Some(&name), Some(&spec), &self.vocab)?;
                            id
                        }
                        None => self.store.create(user_id, &name, &spec, &self.vocab)?,
                    };
                    tracing::info!(%user_id, %strategy_id, %attempt, "strategy synthesized");
                    return Ok((strategy_id, name));
                }
                Err(diagnostic) => {
                    tracing::warn!(%user_id, %attempt, %diagnostic, "synthesis attempt rejected");
                    let repair = format!(
                        "Your previous output was not accepted.\n\nOutput:\n{response}\n\n\
                         Problems:\n{diagnostic}\n\n\
                         Return a corrected {{\"name\", \"spec\"}} JSON object."
                    );
                    self.persist_turn(&conversation_key, "user", &repair);
                    conversation.push(ChatMessage::user(repair));
                    last_diagnostic = diagnostic;
                }
            }
        }

        Err(PipelineError::Synthesis {
            attempts: self.max_attempts,
            diagnostic: last_diagnostic,
            last_response,
        })
    }

    /// Parse and validate one model response. Any failure comes back as the
    /// diagnostic string to feed into the next attempt.
    fn try_accept(&self, response: &str) -> std::result::Result<(String, StrategySpec), String> {
        let block = extract_json_block(response)
            .ok_or_else(|| "no JSON object found in the response".to_string())?;
        let named: NamedSpec = serde_json::from_str(block)
            .map_err(|e| format!("JSON does not match the expected shape: {e}"))?;
        if named.name.trim().is_empty() {
            return Err("name: must not be empty".to_string());
        }
        validate::validate(&named.spec, &self.vocab).map_err(|diags| diags.join("; "))?;
        Ok((named.name, named.spec))
    }

    fn persist_turn(&self, key: &str, role: &str, content: &str) {
        if let Err(e) = self
            .cache
            .append_message(key, StoredMessage::new(role, content, MESSAGE_TTL))
        {
            tracing::warn!(error = %e, "conversation persistence failed");
        }
    }
}

/// Extract the outermost `{...}` block from free-form model output,
/// tolerating prose or code fences around it. Braces inside JSON strings
/// don't count; escapes are honored.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted model: returns canned responses in order and records what
    /// it was asked.
    pub struct ScriptedModel {
        responses: Mutex<Vec<String>>,
        pub requests: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        pub fn new(responses: Vec<&str>) -> Self {
            let mut responses: Vec<String> = responses.into_iter().map(String::from).collect();
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            self.requests.lock().unwrap().push(messages.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| PipelineError::Transport("script exhausted".to_string()))
        }
    }

    fn harness(model: Arc<ScriptedModel>) -> Synthesizer {
        let vocab = Arc::new(Vocabulary::new());
        let store = Arc::new(StrategyStore::open_in_memory().unwrap());
        // The migrations seed the dimension tables; load them so name→id
        // conversion sees the same ids the store will.
        vocab::init(
            &vocab,
            store.list_sectors(),
            store.list_industries(),
            Ok(vec!["market_cap".to_string()]),
        )
        .unwrap();
        Synthesizer::new(model, vocab, store, Arc::new(TtlCache::default()), 3)
    }

    const GOOD: &str = r#"{
        "name": "GLD gap up",
        "spec": {
            "universe": {
                "timeframe": "1d",
                "filters": [{"attribute": "ticker", "include": ["GLD"], "exclude": []}]
            },
            "features": [{
                "name": "gap", "featureId": 0,
                "source": {"field": "ticker", "value": "relative"},
                "output": "raw",
                "expr": [
                    {"column": "open"},
                    {"column": "close", "offset": 1},
                    {"operator": "/"},
                    {"column": "1"},
                    {"operator": "-"}
                ],
                "window": 1
            }],
            "filters": [{"name": "gap_big", "featureId": 0, "operator": ">", "constant": 0.03}]
        }
    }"#;

    /// Same spec with the timeframe missing (empty), which must fail
    /// validation, not deserialization.
    const MISSING_TIMEFRAME: &str = r#"{
        "name": "GLD gap up",
        "spec": {
            "universe": {
                "filters": [{"attribute": "ticker", "include": ["GLD"], "exclude": []}]
            },
            "features": [{
                "name": "gap", "featureId": 0,
                "expr": [{"column": "open"}]
            }],
            "filters": []
        }
    }"#;

    #[tokio::test]
    async fn accepts_first_valid_response() {
        let synth = harness(Arc::new(ScriptedModel::new(vec![GOOD])));
        let cancel = CancellationToken::new();
        let (id, name) = synth
            .synthesize(1, "gold gapped up over 3%", None, &cancel)
            .await
            .unwrap();
        assert!(id > 0);
        assert_eq!(name, "GLD gap up");
    }

    #[tokio::test]
    async fn repair_loop_feeds_diagnostic_back_as_user_turn() {
        let model = Arc::new(ScriptedModel::new(vec![MISSING_TIMEFRAME, GOOD]));
        let synth = harness(Arc::clone(&model));
        let cancel = CancellationToken::new();
        let (id, _) = synth
            .synthesize(1, "gold gapped up over 3%", None, &cancel)
            .await
            .unwrap();
        assert!(id > 0);

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let second = &requests[1];
        let repair_turn = second.last().unwrap();
        assert_eq!(repair_turn.role, "user");
        assert!(repair_turn.content.contains("universe.timeframe"));
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_last_diagnostic_and_response() {
        let synth = harness(Arc::new(ScriptedModel::new(vec![
            "no json",
            "still no json",
            "nope",
        ])));
        let cancel = CancellationToken::new();
        let err = synth
            .synthesize(1, "whatever", None, &cancel)
            .await
            .unwrap_err();
        match err {
            PipelineError::Synthesis {
                attempts,
                diagnostic,
                last_response,
            } => {
                assert_eq!(attempts, 3);
                assert!(diagnostic.contains("no JSON object"));
                assert_eq!(last_response, "nope");
            }
            other => panic!("expected Synthesis, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let synth = harness(Arc::new(ScriptedModel::new(vec![GOOD])));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = synth
            .synthesize(1, "anything", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[test]
    fn extract_json_block_handles_prose_fences_and_strings() {
        assert_eq!(extract_json_block(r#"{"a": 1}"#), Some(r#"{"a": 1}"#));
        assert_eq!(
            extract_json_block("Here you go:\n```json\n{\"a\": {\"b\": 2}}\n```"),
            Some(r#"{"a": {"b": 2}}"#)
        );
        // Braces inside strings don't close the block.
        assert_eq!(
            extract_json_block(r#"{"note": "brace } inside"}"#),
            Some(r#"{"note": "brace } inside"}"#)
        );
        assert_eq!(extract_json_block("no json here"), None);
        assert_eq!(extract_json_block(r#"{"unclosed": 1"#), None);
    }
}
