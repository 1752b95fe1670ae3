use std::collections::VecDeque;
use std::pin::Pin;

use anyhow::{Context, Result, anyhow, bail};
use core_types::{ChatCompletionChunk, ChunkStream};
use futures::{Stream, StreamExt, stream};
use serde_json::Value;
use tracing::{debug, trace};

/// Incremental `text/event-stream` decoder for chat-completion chunks.
///
/// Bytes may arrive split at any point, including inside a UTF-8 sequence;
/// only complete lines are interpreted. Decoding stops at `[DONE]` or at the
/// first failing event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    event: Option<String>,
    done: bool,
}

impl SseDecoder {
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<ChatCompletionChunk>> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.buffer.extend_from_slice(bytes);
        while !self.done {
            let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            self.process_line(&line[..line_end], &mut out);
        }
        out
    }

    /// Flushes a trailing line and pending event once the input has ended.
    pub fn finish(&mut self) -> Vec<Result<ChatCompletionChunk>> {
        let mut out = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(&line, &mut out);
        }
        if !self.done {
            self.dispatch(&mut out);
        }
        self.done = true;
        out
    }

    fn process_line(&mut self, raw: &[u8], out: &mut Vec<Result<ChatCompletionChunk>>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(err) => {
                self.done = true;
                out.push(Err(anyhow!("invalid utf-8 in event stream: {err}")));
                return;
            }
        };

        if line.is_empty() {
            self.dispatch(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_owned()),
            "event" => self.event = Some(value.to_owned()),
            _ => {}
        }
    }

    fn dispatch(&mut self, out: &mut Vec<Result<ChatCompletionChunk>>) {
        let event = self.event.take();
        if self.data.is_empty() {
            return;
        }
        let data = self.data.join("\n");
        self.data.clear();

        if data.trim() == "[DONE]" {
            debug!("received [DONE] marker");
            self.done = true;
            return;
        }

        let item = parse_payload(event.as_deref(), &data);
        if item.is_err() {
            self.done = true;
        }
        out.push(item);
    }
}

fn parse_payload(event: Option<&str>, data: &str) -> Result<ChatCompletionChunk> {
    if event == Some("error") {
        bail!("chat completion stream error: {}", error_detail(data));
    }
    let value: Value = serde_json::from_str(data)
        .with_context(|| format!("invalid chat completion chunk: {data}"))?;
    if let Some(error) = value.get("error") {
        bail!("chat completion stream error: {}", error_message(error));
    }
    serde_json::from_value(value).context("unexpected chat completion chunk shape")
}

/// Human-readable message from an OpenAI-style error body, or the raw text.
pub(crate) fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("error").map(error_message))
        .unwrap_or_else(|| body.trim().to_owned())
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| error.to_string())
}

struct DecodeState<S> {
    inner: Pin<Box<S>>,
    decoder: SseDecoder,
    ready: VecDeque<Result<ChatCompletionChunk>>,
    exhausted: bool,
}

/// Decodes a raw byte stream into chat-completion chunks.
///
/// The byte stream is dropped as soon as decoding finishes, which for an HTTP
/// body releases the underlying connection.
pub fn decode_sse_stream<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let state = DecodeState {
        inner: Box::pin(bytes),
        decoder: SseDecoder::default(),
        ready: VecDeque::new(),
        exhausted: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.exhausted || state.decoder.is_done() {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(bytes)) => {
                    let bytes = bytes.as_ref();
                    trace!(bytes_len = bytes.len(), "received event stream data");
                    state.ready.extend(state.decoder.feed(bytes));
                }
                Some(Err(err)) => {
                    state.exhausted = true;
                    let err: anyhow::Error = err.into();
                    state
                        .ready
                        .push_back(Err(err.context("chat completion stream interrupted")));
                }
                None => {
                    state.exhausted = true;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    }))
}
