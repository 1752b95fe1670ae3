use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use core_types::{
    AiClient, AiError, ChatCompletionRequest, ChatCompletions, EvalOptions, Prompt, TokenCallback,
};
use futures::StreamExt;
use provider_openai::HttpChatCompletions;
use tracing::{debug, warn};
use uuid::Uuid;

/// Streams a chat completion from an OpenAI-compatible backend and assembles
/// the generated text.
///
/// The adapter only holds read-only configuration, so one instance can serve
/// any number of concurrent [`evaluate`](Self::evaluate) calls.
pub struct CompletionAdapter {
    transport: Arc<dyn ChatCompletions>,
    model: Option<String>,
}

impl CompletionAdapter {
    /// Never fails; a bad endpoint or key is reported by the first request.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, model: Option<String>) -> Self {
        Self::with_transport(Arc::new(HttpChatCompletions::new(endpoint, api_key)), model)
    }

    pub fn with_transport(transport: Arc<dyn ChatCompletions>, model: Option<String>) -> Self {
        Self { transport, model }
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub async fn evaluate(&self, prompt: &Prompt, options: EvalOptions) -> Result<String, AiError> {
        let request_id = Uuid::new_v4();
        self.run(request_id, prompt, options).await.map_err(|err| {
            warn!(%request_id, error = %format!("{err:#}"), "chat completion failed");
            AiError::from(err)
        })
    }

    async fn run(&self, request_id: Uuid, prompt: &Prompt, options: EvalOptions) -> Result<String> {
        let max_tokens = options.resolved_max_tokens();
        let mut on_token: TokenCallback = match options.on_token {
            Some(callback) => callback,
            None => Box::new(|_: &str| {}),
        };
        let request = ChatCompletionRequest {
            model: self.model.clone().unwrap_or_default(),
            messages: prompt.to_vec(),
            max_tokens,
            stream: true,
        };

        debug!(
            %request_id,
            model = %request.model,
            max_tokens,
            messages = request.messages.len(),
            "starting chat completion"
        );

        // Owned by this frame: every return below drops the stream and its connection.
        let mut stream = self
            .transport
            .create(request)
            .await
            .context("failed to start chat completion")?;

        let mut buffer = String::new();
        let mut fragments = 0_usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("chat completion stream failed")?;
            let token = chunk.first_delta_text();
            on_token(token);
            buffer.push_str(token);
            fragments += 1;
        }

        debug!(
            %request_id,
            fragments,
            chars = buffer.chars().count(),
            "chat completion finished"
        );
        Ok(buffer)
    }
}

#[async_trait]
impl AiClient for CompletionAdapter {
    async fn evaluate(&self, prompt: &Prompt, options: EvalOptions) -> Result<String, AiError> {
        CompletionAdapter::evaluate(self, prompt, options).await
    }
}
