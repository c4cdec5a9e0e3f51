//! Language-model gateways.
//!
//! [`OllamaModel`] talks to `POST {url}/api/generate`, either blocking
//! (`"stream": false`) or as newline-delimited JSON fragments.
//! [`DisabledModel`] is used when `llm.provider = "disabled"`; it fails every
//! call with `ModelUnavailable`, so only questions with no retrieved evidence
//! (answered without the model) succeed.

use anyhow::bail;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use research_copilot_core::error::{CopilotError, Result};
use research_copilot_core::synth::{LanguageModel, TextStream};

use crate::config::LlmConfig;

fn unavailable(msg: impl std::fmt::Display) -> CopilotError {
    CopilotError::ModelUnavailable(msg.to_string())
}

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(unavailable(
            "llm provider is disabled; set [llm] provider in the config",
        ))
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// One blocking response, or one line of a streamed response.
#[derive(Debug, Deserialize)]
struct GenerateFragment {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct OllamaModel {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaModel {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/api/generate", self.url);
        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream,
            })
            .send()
            .await
            .map_err(|e| {
                unavailable(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(unavailable(format!("Ollama API error {}: {}", status, body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let fragment: GenerateFragment = self
            .send(prompt, false)
            .await?
            .json()
            .await
            .map_err(|e| unavailable(format!("invalid Ollama response: {}", e)))?;
        if let Some(err) = fragment.error {
            return Err(unavailable(err));
        }
        debug!(model = %self.model, chars = fragment.response.len(), "generated");
        Ok(fragment.response)
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TextStream> {
        let response = self.send(prompt, true).await?;
        Ok(ndjson_fragments(response.bytes_stream().boxed()))
    }
}

struct LineReader<B, E> {
    bytes: BoxStream<'static, std::result::Result<B, E>>,
    buf: Vec<u8>,
    finished: bool,
}

/// Turn a byte stream of NDJSON generate fragments into text increments.
/// Lines may be split across network chunks; the stream ends at the
/// first `"done": true` fragment or when the body ends.
pub fn ndjson_fragments<B, E>(bytes: BoxStream<'static, std::result::Result<B, E>>) -> TextStream
where
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let reader = LineReader {
        bytes,
        buf: Vec::new(),
        finished: false,
    };

    stream::try_unfold(reader, next_fragment).boxed()
}

async fn next_fragment<B, E>(mut reader: LineReader<B, E>) -> Result<Option<(String, LineReader<B, E>)>>
where
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    loop {
        if reader.finished {
            return Ok(None);
        }

        if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = reader.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fragment: GenerateFragment = serde_json::from_str(line)
                .map_err(|e| unavailable(format!("invalid Ollama stream line: {}", e)))?;
            if let Some(err) = fragment.error {
                return Err(unavailable(err));
            }
            reader.finished = fragment.done;
            if fragment.response.is_empty() {
                continue;
            }
            return Ok(Some((fragment.response, reader)));
        }

        match reader.bytes.next().await {
            Some(Ok(chunk)) => reader.buf.extend_from_slice(chunk.as_ref()),
            Some(Err(e)) => return Err(unavailable(format!("Ollama stream error: {}", e))),
            None => {
                if reader.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                // Trailing line without a newline
                reader.buf.push(b'\n');
            }
        }
    }
}

/// Instantiate the model named by `llm.provider`.
pub fn create_model(config: &LlmConfig) -> anyhow::Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "ollama" => Ok(Arc::new(OllamaModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
