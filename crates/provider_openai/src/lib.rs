mod sse;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use core_types::{ChatCompletionRequest, ChatCompletions, ChunkStream};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

pub use sse::{SseDecoder, decode_sse_stream};

/// `ChatCompletions` over HTTP against any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct HttpChatCompletions {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    extra_headers: Vec<(String, String)>,
}

impl HttpChatCompletions {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
            extra_headers: Vec::new(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_extra_headers(mut self, extra_headers: Vec<(String, String)>) -> Self {
        self.extra_headers = extra_headers;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }

    fn request_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
        {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {api_key}"))
                    .context("invalid authorization header")?,
            );
        }
        apply_extra_headers(&mut headers, &self.extra_headers)?;
        Ok(headers)
    }
}

#[async_trait]
impl ChatCompletions for HttpChatCompletions {
    async fn create(&self, request: ChatCompletionRequest) -> Result<ChunkStream> {
        let url = self.chat_completions_url();
        let headers = self.request_headers()?;
        debug!(%url, model = %request.model, "posting chat completion request");

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to request {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%url, %status, "chat completion request rejected");
            bail!(
                "chat completion request failed: {status} {}",
                sse::error_detail(&text)
            );
        }

        Ok(decode_sse_stream(response.bytes_stream()))
    }
}

fn apply_extra_headers(headers: &mut HeaderMap, extra_headers: &[(String, String)]) -> Result<()> {
    for (key, value) in extra_headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| anyhow!("invalid header name: {key}"))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| anyhow!("invalid header value for {key}"))?;
        headers.insert(name, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_endpoint_and_path() {
        let transport = HttpChatCompletions::new("http://localhost:11434/v1/", None);
        assert_eq!(
            transport.chat_completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn omits_authorization_without_key() {
        let headers = HttpChatCompletions::new("http://localhost", Some("  ".to_string()))
            .request_headers()
            .expect("headers");
        assert!(headers.get(reqwest::header::AUTHORIZATION).is_none());
    }

    #[test]
    fn applies_bearer_and_extra_headers() {
        let headers = HttpChatCompletions::new("http://localhost", Some("sk-test".to_string()))
            .with_extra_headers(vec![("X-Title".to_string(), "relay".to_string())])
            .request_headers()
            .expect("headers");
        assert_eq!(headers[reqwest::header::AUTHORIZATION], "Bearer sk-test");
        assert_eq!(headers["x-title"], "relay");
    }

    #[test]
    fn rejects_invalid_extra_header_name() {
        let err = HttpChatCompletions::new("http://localhost", None)
            .with_extra_headers(vec![("bad header".to_string(), "v".to_string())])
            .request_headers()
            .expect_err("invalid name");
        assert!(err.to_string().contains("bad header"));
    }
}
