use std::fmt;
use std::num::NonZeroU32;
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_TOKENS: u32 = 1024;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk>> + Send + 'static>>;
pub type TokenCallback = Box<dyn FnMut(&str) + Send + 'static>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

pub type Prompt = [PromptMessage];

/// Per-call options for [`AiClient::evaluate`].
///
/// Unset fields are resolved by the client at the start of each call:
/// `max_tokens` falls back to [`DEFAULT_MAX_TOKENS`] and a missing
/// `on_token` behaves as a no-op.
#[derive(Default)]
pub struct EvalOptions {
    pub max_tokens: Option<NonZeroU32>,
    pub on_token: Option<TokenCallback>,
}

impl EvalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero is treated as "unset".
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = NonZeroU32::new(max_tokens);
        self
    }

    pub fn on_token(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_token = Some(Box::new(callback));
        self
    }

    pub fn resolved_max_tokens(&self) -> u32 {
        self.max_tokens
            .map(NonZeroU32::get)
            .unwrap_or(DEFAULT_MAX_TOKENS)
    }
}

impl fmt::Debug for EvalOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalOptions")
            .field("max_tokens", &self.max_tokens)
            .field("on_token", &self.on_token.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Body of `POST /chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub max_tokens: u32,
    pub stream: bool,
}

/// One `chat.completion.chunk` object from the event stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                index: 0,
                delta: Some(ChunkDelta {
                    role: None,
                    content: Some(text.into()),
                }),
                finish_reason: None,
            }],
            ..Self::default()
        }
    }

    /// Text of the first choice's delta, or `""` when the chunk carries none.
    pub fn first_delta_text(&self) -> &str {
        self.choices
            .first()
            .and_then(|choice| choice.delta.as_ref())
            .and_then(|delta| delta.content.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Failure of a completion call, wrapping whatever the transport reported.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct AiError(#[from] anyhow::Error);

impl AiError {
    pub fn cause(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn into_cause(self) -> anyhow::Error {
        self.0
    }
}

/// Minimal capability of an OpenAI-compatible chat-completions backend.
#[async_trait]
pub trait ChatCompletions: Send + Sync {
    async fn create(&self, request: ChatCompletionRequest) -> Result<ChunkStream>;
}

#[async_trait]
pub trait AiClient: Send + Sync {
    async fn evaluate(
        &self,
        prompt: &Prompt,
        options: EvalOptions,
    ) -> std::result::Result<String, AiError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_chunk_with_text_delta() {
        let chunk: ChatCompletionChunk = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hel"}, "finish_reason": null}]
        }))
        .expect("chunk");
        assert_eq!(chunk.first_delta_text(), "Hel");
        let delta = chunk.choices[0].delta.as_ref().expect("delta");
        assert_eq!(delta.role.as_deref(), Some("assistant"));
    }

    #[test]
    fn missing_delta_content_reads_as_empty() {
        let finish: ChatCompletionChunk = serde_json::from_value(json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
        }))
        .expect("chunk");
        assert_eq!(finish.first_delta_text(), "");

        let no_choices: ChatCompletionChunk =
            serde_json::from_value(json!({"choices": []})).expect("chunk");
        assert_eq!(no_choices.first_delta_text(), "");

        let no_delta: ChatCompletionChunk =
            serde_json::from_value(json!({"choices": [{"index": 0}]})).expect("chunk");
        assert_eq!(no_delta.first_delta_text(), "");

        let null_delta: ChatCompletionChunk = serde_json::from_value(
            json!({"choices": [{"index": 0, "delta": null, "finish_reason": "stop"}]}),
        )
        .expect("chunk");
        assert_eq!(null_delta.first_delta_text(), "");

        let null_content: ChatCompletionChunk = serde_json::from_value(
            json!({"choices": [{"delta": {"role": "assistant", "content": null}}]}),
        )
        .expect("chunk");
        assert_eq!(null_content.first_delta_text(), "");
    }

    #[test]
    fn only_first_choice_is_read() {
        let chunk: ChatCompletionChunk = serde_json::from_value(json!({
            "choices": [
                {"index": 0, "delta": {"content": "a"}},
                {"index": 1, "delta": {"content": "b"}}
            ]
        }))
        .expect("chunk");
        assert_eq!(chunk.first_delta_text(), "a");
    }

    #[test]
    fn serializes_request_in_wire_shape() {
        let request = ChatCompletionRequest {
            model: String::new(),
            messages: vec![PromptMessage::system("be brief"), PromptMessage::user("hi")],
            max_tokens: DEFAULT_MAX_TOKENS,
            stream: true,
        };
        let value = serde_json::to_value(&request).expect("json");
        assert_eq!(
            value,
            json!({
                "model": "",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"}
                ],
                "max_tokens": 1024,
                "stream": true
            })
        );
    }

    #[test]
    fn max_tokens_defaults_when_unset_or_zero() {
        assert_eq!(EvalOptions::new().resolved_max_tokens(), 1024);
        assert_eq!(EvalOptions::new().with_max_tokens(0).resolved_max_tokens(), 1024);
        assert_eq!(EvalOptions::new().with_max_tokens(64).resolved_max_tokens(), 64);
    }
}
