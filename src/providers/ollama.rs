//! Ollama generation provider
//!
//! Uses `/api/generate`. Streaming responses are newline-delimited JSON
//! objects, each carrying the next `response` fragment; the last one has
//! `done: true`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use super::{FragmentStream, Generator};
use crate::config::GenerationConfig;
use crate::error::{ChatRelayError, Result};

/// Ollama API generator
///
/// # Examples
///
/// ```no_run
/// use chatrelay::config::GenerationConfig;
/// use chatrelay::providers::{Generator, OllamaGenerator};
///
/// # async fn example() -> chatrelay::error::Result<()> {
/// let generator = OllamaGenerator::new(GenerationConfig::default())?;
/// let reply = generator.generate("Say hello").await?;
/// # Ok(())
/// # }
/// ```
pub struct OllamaGenerator {
    client: Client,
    config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaGenerator {
    /// Create a generator for the configured host and model
    ///
    /// The client has no overall request timeout because streamed replies
    /// are long-lived; callers bound the stream instead.
    pub fn new(config: GenerationConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("chatrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChatRelayError::Provider(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!(
            "Initialized Ollama generator: host={}, model={}",
            config.host,
            config.model
        );

        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!("{}/api/generate", self.config.host.trim_end_matches('/'))
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream,
        };

        let mut builder = self.client.post(self.url()).json(&request);
        if !stream {
            builder = builder.timeout(Duration::from_secs(self.config.timeout_secs));
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!("Ollama request failed: {}", e);
            ChatRelayError::Provider(format!("Ollama request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!("Ollama returned error {}: {}", status, error_text);
            return Err(ChatRelayError::Provider(format!(
                "Ollama returned error {}: {}",
                status, error_text
            ))
            .into());
        }

        Ok(response)
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream> {
        tracing::debug!(prompt_len = prompt.len(), "Starting Ollama stream");
        let response = self.send(prompt, true).await?;
        Ok(parse_ndjson_stream(response.bytes_stream()).boxed())
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let response = self.send(prompt, false).await?;
        let body: GenerateResponse = response.json().await.map_err(|e| {
            tracing::error!("Failed to parse Ollama response: {}", e);
            ChatRelayError::Provider(format!("Failed to parse Ollama response: {}", e))
        })?;
        if let Some(error) = body.error {
            return Err(ChatRelayError::Provider(error).into());
        }
        Ok(body.response)
    }
}

struct NdjsonState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    ready: VecDeque<Result<String>>,
    finished: bool,
}

impl<S> NdjsonState<S> {
    /// Parses one line; returns true when the stream is complete
    fn take_line(&mut self, line: &[u8]) -> bool {
        let line = match std::str::from_utf8(line) {
            Ok(line) => line.trim(),
            Err(e) => {
                self.ready.push_back(Err(ChatRelayError::Provider(format!(
                    "Invalid UTF-8 in stream: {}",
                    e
                ))
                .into()));
                return true;
            }
        };
        if line.is_empty() {
            return false;
        }

        match serde_json::from_str::<GenerateResponse>(line) {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    self.ready
                        .push_back(Err(ChatRelayError::Provider(error).into()));
                    return true;
                }
                if !chunk.response.is_empty() {
                    self.ready.push_back(Ok(chunk.response));
                }
                chunk.done
            }
            Err(e) => {
                self.ready.push_back(Err(ChatRelayError::Provider(format!(
                    "Malformed stream line: {}",
                    e
                ))
                .into()));
                true
            }
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.take_line(&line) {
                self.finished = true;
                self.buffer.clear();
                return;
            }
        }
    }
}

/// Turns an Ollama NDJSON byte stream into text fragments.
///
/// Lines may be split across chunks. Empty fragments are skipped; the
/// stream ends after `done: true`, an `error` line, a transport error or a
/// line that is not valid JSON.
pub fn parse_ndjson_stream<S, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: fmt::Display,
{
    let state = NdjsonState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state.ready.push_back(Err(ChatRelayError::Provider(format!(
                        "Stream interrupted: {}",
                        e
                    ))
                    .into()));
                    state.finished = true;
                }
                None => {
                    let rest = std::mem::take(&mut state.buffer);
                    state.take_line(&rest);
                    state.finished = true;
                }
            }
        }
    })
}
