//! LLM access for diagnosis, quality scoring and plan regeneration.
//!
//! LLM replies are untrusted free-form text. Every consumer goes through
//! [`parse_json_reply`], which yields `None` for anything malformed so callers
//! can fall back to a safe default.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use waypoint_core::config::LlmConfig;
use waypoint_providers::{CompletionRequest, Message, Provider, ProviderError};

/// Thin client over a [`Provider`] with fixed model settings.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn Provider>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl LlmClient {
    /// Create a client from LLM settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    /// The model name.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send messages and return the reply text.
    ///
    /// # Errors
    ///
    /// Returns error if the provider call fails.
    pub async fn complete(
        &self,
        messages: Vec<Message>,
        temperature: Option<f32>,
    ) -> Result<String, ProviderError> {
        let (system, messages): (Vec<Message>, Vec<Message>) = messages
            .into_iter()
            .partition(|m| m.role == waypoint_providers::Role::System);

        let request = CompletionRequest {
            model: self.model.clone(),
            messages,
            system: (!system.is_empty()).then(|| {
                system
                    .into_iter()
                    .map(|m| m.content)
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }),
            max_tokens: self.max_tokens,
            temperature: temperature.unwrap_or(self.temperature),
        };

        let response = self.provider.complete(request).await?;
        tracing::debug!(
            provider = self.provider.name(),
            tokens = response.usage.total(),
            "LLM reply received"
        );
        Ok(response.text)
    }

    /// Send messages and parse the reply as JSON.
    ///
    /// Returns `None` on provider failure or a malformed reply.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        messages: Vec<Message>,
        temperature: Option<f32>,
    ) -> Option<T> {
        match self.complete(messages, temperature).await {
            Ok(text) => {
                let parsed = parse_json_reply(&text);
                if parsed.is_none() {
                    tracing::warn!(reply_len = text.len(), "Malformed LLM reply ignored");
                }
                parsed
            }
            Err(e) => {
                tracing::warn!(error = %e, "LLM call failed");
                None
            }
        }
    }
}

/// Extract a JSON value of type `T` from free-form LLM text.
///
/// Accepts bare JSON, fenced code blocks, and JSON embedded in prose. The
/// first candidate that deserializes into `T` wins.
#[must_use]
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Option<T> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(fenced) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(fenced) {
            return Some(value);
        }
    }

    balanced_candidates(trimmed)
        .into_iter()
        .find_map(|candidate| serde_json::from_str(candidate).ok())
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n').map_or(0, |i| i + 1);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// Every top-level balanced `{...}` or `[...]` span, in order of appearance.
fn balanced_candidates(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut candidates = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if matches!(bytes[i], b'{' | b'[') {
            if let Some(end) = matching_close(bytes, i) {
                candidates.push(&text[i..=end]);
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }

    candidates
}

fn matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }

    None
}

/// Truncate text on a char boundary for prompt embedding.
#[must_use]
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}

/// Convenience constructor for a system + user prompt pair.
#[must_use]
pub fn prompt(system: &str, user: String) -> Vec<Message> {
    vec![Message::system(system), Message::user(user)]
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider for tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use waypoint_core::types::TokenUsage;
    use waypoint_providers::{CompletionRequest, CompletionResponse, Provider, ProviderError};

    /// Replies with queued texts, then with a fixed fallback.
    pub struct ScriptedProvider {
        replies: Mutex<VecDeque<Result<String, String>>>,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        pub fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            self.requests.lock().unwrap().push(request);
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Ok(text)) => Ok(CompletionResponse {
                    id: "scripted".to_string(),
                    model: "scripted".to_string(),
                    text,
                    stop_reason: None,
                    usage: TokenUsage::default(),
                }),
                Some(Err(message)) => Err(ProviderError::Api {
                    status: 500,
                    message,
                }),
                None => Err(ProviderError::Config("no scripted reply left".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Score {
        score: f64,
    }

    #[test]
    fn test_bare_json() {
        assert_eq!(
            parse_json_reply::<Score>(r#"{"score": 0.8}"#),
            Some(Score { score: 0.8 })
        );
    }

    #[test]
    fn test_fenced_json() {
        let text = "Here you go:\n```json\n{\"score\": 0.5}\n```\nThanks";
        assert_eq!(parse_json_reply::<Score>(text), Some(Score { score: 0.5 }));
    }

    #[test]
    fn test_embedded_json_with_braces_in_strings() {
        let text = r#"I think {not json} but {"score": 0.9, "note": "a } brace"} fits."#;
        assert_eq!(parse_json_reply::<Score>(text), Some(Score { score: 0.9 }));
    }

    #[test]
    fn test_malformed_inputs() {
        assert_eq!(parse_json_reply::<Score>(""), None);
        assert_eq!(parse_json_reply::<Score>("no json here"), None);
        assert_eq!(parse_json_reply::<Score>(r#"{"score": }"#), None);
        assert_eq!(parse_json_reply::<Score>(r#"{"score": "high"}"#), None);
        assert_eq!(parse_json_reply::<Score>("```json\n{\"score\"\n"), None);
        assert_eq!(parse_json_reply::<Score>("[1, 2"), None);
    }

    #[test]
    fn test_array_reply() {
        let steps: Option<Vec<serde_json::Value>> =
            parse_json_reply("Plan:\n[{\"tool\": \"echo\"}]");
        assert_eq!(steps.unwrap().len(), 1);
    }

    #[test]
    fn test_truncate_for_prompt() {
        assert_eq!(truncate_for_prompt("abcdef", 3), "abc...");
        assert_eq!(truncate_for_prompt("abc", 3), "abc");
    }

    #[tokio::test]
    async fn test_client_fails_to_none() {
        let provider = Arc::new(testing::ScriptedProvider::new(vec![Err("boom")]));
        let client = LlmClient::new(provider, &LlmConfig::default());
        let reply: Option<Score> = client.complete_json(prompt("sys", "user".into()), None).await;
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_client_splits_system_prompt() {
        let provider = Arc::new(testing::ScriptedProvider::new(vec![Ok("{\"score\": 1.0}")]));
        let client = LlmClient::new(provider.clone(), &LlmConfig::default());
        let reply: Option<Score> = client
            .complete_json(prompt("be terse", "rate this".into()), Some(0.0))
            .await;

        assert_eq!(reply, Some(Score { score: 1.0 }));
        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].system.as_deref(), Some("be terse"));
        assert_eq!(requests[0].messages.len(), 1);
        assert!(requests[0].temperature.abs() < f32::EPSILON);
    }
}
