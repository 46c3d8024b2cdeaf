// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Client for OpenAI-compatible `/chat/completions` endpoints.
//!
//! One client serves both the streaming agentic flow and the non-streaming
//! auxiliary calls (summaries, commit messages). Rate limits and server
//! errors are retried with exponential backoff before a request is given up
//! on; anything else surfaces as a typed [`LlmError`] so the coordinator can
//! decide whether to feed the failure back into the conversation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cost::CostTracker;
use crate::request_log::RequestLog;
use crate::types::{ApiMessage, ResponseEvent};

/// Errors from the model transport.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Rate limited / server errors, retried up to the configured count.
    #[error("provider still rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Non-retryable HTTP failure. The body is preserved so it can be fed
    /// back into the conversation for the model to self-correct on.
    #[error("provider error {status}:\n{body}")]
    Fatal { status: u16, body: String },

    /// An error object delivered inside a streaming chunk (content filter,
    /// upstream provider failure). Retryable by re-issuing the request.
    #[error("streaming error (provider={provider}, code={code}): {message}")]
    Provider {
        provider: String,
        code: String,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Async client used by the session runner and the summary engine.
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
    max_retries: u32,
    costs: Arc<CostTracker>,
    request_log: Arc<RequestLog>,
}

impl LlmClient {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        costs: Arc<CostTracker>,
        request_log: Arc<RequestLog>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            max_retries: 5,
            costs,
            request_log,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Same transport, different model. Used for the cheap/fast model.
    pub fn for_model(&self, model: impl Into<String>) -> Self {
        let mut c = self.clone();
        c.model = model.into();
        c
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send_with_retry(&self, payload: &Value) -> Result<reqwest::Response, LlmError> {
        let mut attempt = 0u32;
        loop {
            let sent = self
                .http
                .post(self.chat_url())
                .bearer_auth(&self.api_key)
                // Fine-grained tool streaming for Anthropic models routed
                // through OpenRouter.
                .header("x-anthropic-beta", "fine-grained-tool-streaming-2025-05-14")
                .json(payload)
                .send()
                .await;

            let resp = match sent {
                Ok(r) => r,
                Err(e) => {
                    if attempt + 1 >= self.max_retries {
                        return Err(LlmError::Transport(e));
                    }
                    warn!(error = %e, attempt, "transport error, backing off");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = resp.status();
            if status.as_u16() == 429 || status.is_server_error() {
                if attempt + 1 >= self.max_retries {
                    return Err(LlmError::RateLimited { attempts: attempt + 1 });
                }
                warn!(
                    status = status.as_u16(),
                    wait_s = backoff_delay(attempt).as_secs(),
                    "rate limited, backing off before retry"
                );
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(LlmError::Fatal { status: status.as_u16(), body });
            }

            return Ok(resp);
        }
    }

    /// Non-streaming chat completion. Returns the parsed response body.
    pub async fn chat(
        &self,
        messages: &[ApiMessage],
        tools: Option<&[Value]>,
    ) -> Result<Value, LlmError> {
        let payload = self.build_payload(messages, tools, false);
        debug!(model = %self.model, message_count = messages.len(), "chat request");
        let entry = self.request_log.log_request(&payload, &self.model, false);

        let resp = self.send_with_retry(&payload).await?;
        let body: Value = resp.json().await?;

        let generation_id = body["id"].as_str().map(str::to_string);
        let cost = match &generation_id {
            Some(id) => self.fetch_generation_cost(id).await,
            None => None,
        };
        self.request_log.log_response(entry, &body, cost, generation_id);
        Ok(body)
    }

    /// Non-streaming chat, returning just the assistant text.
    pub async fn chat_text(&self, messages: &[ApiMessage]) -> Result<String, LlmError> {
        let body = self.chat(messages, None).await?;
        Ok(extract_text(&body).unwrap_or_default())
    }

    /// Streaming chat completion. The SSE stream is consumed on a dedicated
    /// worker task; decoded events arrive on the returned channel. The
    /// channel closes after `Done`, a provider error, or a transport error.
    pub async fn chat_stream(
        &self,
        messages: &[ApiMessage],
        tools: Option<&[Value]>,
    ) -> Result<mpsc::Receiver<Result<ResponseEvent, LlmError>>, LlmError> {
        let payload = self.build_payload(messages, tools, true);
        debug!(model = %self.model, message_count = messages.len(), "streaming chat request");
        let entry = self.request_log.log_request(&payload, &self.model, true);

        let resp = self.send_with_retry(&payload).await?;

        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        tokio::spawn(async move {
            this.pump_sse(resp, entry, tx).await;
        });
        Ok(rx)
    }

    /// Worker loop: decode SSE lines into events until `[DONE]`, an error
    /// chunk, or the connection drops, then resolve the generation cost.
    async fn pump_sse(
        &self,
        resp: reqwest::Response,
        log_entry: usize,
        tx: mpsc::Sender<Result<ResponseEvent, LlmError>>,
    ) {
        use futures::StreamExt;

        let mut body = resp.bytes_stream();
        let mut buf = String::new();
        let mut generation_id: Option<String> = None;
        let mut chunks: Vec<Value> = Vec::new();
        let mut done = false;

        'outer: while let Some(piece) = body.next().await {
            let bytes = match piece {
                Ok(b) => b,
                Err(e) => {
                    let _ = tx.send(Err(LlmError::Transport(e))).await;
                    break;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&bytes));

            // SSE events can be split across TCP packets; only complete
            // `\n`-terminated lines are consumed, the rest stays buffered.
            while let Some(line) = next_complete_line(&mut buf) {
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    done = true;
                    let _ = tx.send(Ok(ResponseEvent::Done)).await;
                    break 'outer;
                }
                let Ok(chunk) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if generation_id.is_none() {
                    generation_id = chunk["id"].as_str().map(str::to_string);
                }
                let parsed = parse_chunk(&chunk);
                chunks.push(chunk);
                match parsed {
                    Ok(Some(event)) => {
                        if tx.send(Ok(event)).await.is_err() {
                            // Receiver dropped (cancellation) – stop pumping.
                            break 'outer;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break 'outer;
                    }
                }
            }
        }

        if !done {
            debug!("stream ended without [DONE] sentinel");
        }

        let cost = match &generation_id {
            Some(id) => self.fetch_generation_cost(id).await,
            None => None,
        };
        self.request_log.log_response(
            log_entry,
            &json!({ "chunks": chunks, "id": generation_id }),
            cost,
            generation_id,
        );
    }

    fn build_payload(&self, messages: &[ApiMessage], tools: Option<&[Value]>, stream: bool) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
        });
        if stream {
            payload["stream"] = json!(true);
        }
        if let Some(tools) = tools {
            if !tools.is_empty() {
                payload["tools"] = json!(tools);
            }
        }
        payload
    }

    /// Fetch the USD cost of a generation and record it.
    ///
    /// The cost may not be available immediately after the response, so this
    /// polls up to 3 times with short delays. Failures are silently skipped –
    /// cost tracking is advisory.
    async fn fetch_generation_cost(&self, generation_id: &str) -> Option<f64> {
        let url = format!("{}/generation?id={generation_id}", self.base_url);
        for _ in 0..3 {
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&self.api_key)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            match resp {
                Ok(r) if r.status().is_success() => {
                    let body: Value = match r.json().await {
                        Ok(v) => v,
                        Err(_) => return None,
                    };
                    if let Some(cost) = body["data"]["total_cost"].as_f64() {
                        self.costs.add_cost(cost);
                        debug!(cost, "recorded generation cost");
                        return Some(cost);
                    }
                    // Cost not ready yet.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Ok(_) | Err(_) => return None,
            }
        }
        None
    }
}

/// Blocking client for tools that run on the synchronous tool-execution
/// worker (scout). Minimal surface: one prompt in, text out.
pub struct BlockingLlmClient {
    api_key: String,
    model: String,
    base_url: String,
}

impl BlockingLlmClient {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn chat(&self, prompt: &str) -> anyhow::Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let client = reqwest::blocking::Client::new();
        let mut attempt = 0u32;
        loop {
            let resp = client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()?;
            let status = resp.status();
            if status.as_u16() == 429 && attempt < 3 {
                std::thread::sleep(backoff_delay(attempt));
                attempt += 1;
                continue;
            }
            if !status.is_success() {
                anyhow::bail!(
                    "provider error {status}: {}",
                    resp.text().unwrap_or_default()
                );
            }
            let body: Value = resp.json()?;
            return Ok(extract_text(&body).unwrap_or_default());
        }
    }
}

/// Exponential backoff: 1s, 2s, 4s, 8s, 16s.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(4))
}

/// Drain one complete `\n`-terminated line from `buf`, stripping an optional
/// `\r`. Returns `None` while only an incomplete line remains.
fn next_complete_line(buf: &mut String) -> Option<String> {
    let pos = buf.find('\n')?;
    let line = buf[..pos].trim_end_matches('\r').to_string();
    buf.drain(..=pos);
    Some(line)
}

/// Decode one parsed SSE chunk into a response event.
///
/// Error chunks carry `{error: {message, code, metadata}}` and surface as
/// retryable failures. Chunks with nothing of interest yield `None`.
fn parse_chunk(v: &Value) -> Result<Option<ResponseEvent>, LlmError> {
    if let Some(error) = v.get("error") {
        return Err(LlmError::Provider {
            provider: error["metadata"]["provider_name"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
            code: error["code"].as_str().unwrap_or_default().to_string(),
            message: error["message"]
                .as_str()
                .unwrap_or("unknown streaming error")
                .to_string(),
        });
    }

    let delta = &v["choices"][0]["delta"];

    // Each chunk carries at most one tool-call delta in practice; the index
    // routes accumulation across parallel calls.
    if let Some(tc) = delta.get("tool_calls").and_then(Value::as_array).and_then(|a| a.first()) {
        return Ok(Some(ResponseEvent::ToolCallDelta {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or_default().to_string(),
            name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or_default().to_string(),
        }));
    }

    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            return Ok(Some(ResponseEvent::TextDelta(text.to_string())));
        }
    }

    Ok(None)
}

/// Extract the assistant text from a non-streaming response body.
pub fn extract_text(body: &Value) -> Option<String> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
