/// Streaming chat-model client.
///
/// One client talks to either a local Ollama server (`POST /api/chat`, newline-delimited
/// JSON) or a hosted OpenAI-compatible endpoint (`POST /chat/completions`, server-sent
/// events). The backend is picked by configuration; the stream decoder accepts either wire
/// format regardless, so a proxy that re-frames one as the other still works.
///
/// Requests are sent exactly once. Retry policy belongs to the caller.
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlmBackend {
    /// Local Ollama server.
    Ollama,
    /// Hosted OpenAI-compatible inference endpoint (requires an API key).
    Hosted,
}

impl LlmBackend {
    pub fn parse(name: &str) -> Result<Self, LlmClientError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ollama" | "local" => Ok(Self::Ollama),
            "hosted" | "openai" | "huggingface" => Ok(Self::Hosted),
            other => Err(LlmClientError::Config(format!(
                "unknown LLM_BACKEND '{other}', expected 'ollama' or 'hosted'"
            ))),
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::Ollama => "http://localhost:11434",
            Self::Hosted => "https://router.huggingface.co/v1",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Self::Ollama => "llama3.1",
            Self::Hosted => "meta-llama/Llama-3.1-8B-Instruct",
        }
    }

    fn chat_path(self) -> &'static str {
        match self {
            Self::Ollama => "/api/chat",
            Self::Hosted => "/chat/completions",
        }
    }
}

#[derive(Clone)]
pub struct LlmClientConfig {
    pub backend: LlmBackend,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    /// Whole-request deadline. `None` lets a stream run as long as the backend keeps it open.
    pub request_timeout: Option<Duration>,
    pub max_error_body_bytes: usize,
}

impl LlmClientConfig {
    /// Build a config for `backend` with its default model, pointed at `base_url`.
    pub fn new(backend: LlmBackend, base_url: &str) -> Self {
        Self {
            backend,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: backend.default_model().to_string(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            max_error_body_bytes: 8 * 1024,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `LLM_BACKEND`: `ollama` (default) or `hosted`
    /// - `LLM_BASE_URL`: defaults per backend
    /// - `LLM_MODEL`: defaults per backend
    /// - `LLM_API_KEY` (fallback `HF_TOKEN`): required for `hosted`
    /// - `LLM_CONNECT_TIMEOUT_SECS`: default 10
    /// - `LLM_REQUEST_TIMEOUT_SECS`: optional whole-request deadline
    pub fn from_env() -> Result<Self, LlmClientError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, LlmClientError> {
        let backend = match var("LLM_BACKEND") {
            Some(name) => LlmBackend::parse(&name)?,
            None => LlmBackend::Ollama,
        };

        let base_url = var("LLM_BASE_URL").unwrap_or_else(|| backend.default_base_url().to_string());
        let mut config = Self::new(backend, &base_url);

        if let Some(model) = var("LLM_MODEL") {
            config.model = model;
        }

        config.api_key = var("LLM_API_KEY")
            .or_else(|| var("HF_TOKEN"))
            .filter(|k| !k.trim().is_empty());
        if backend == LlmBackend::Hosted && config.api_key.is_none() {
            return Err(LlmClientError::MissingApiKey);
        }

        if let Some(timeout) = parse_secs(&var, "LLM_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = timeout;
        }
        config.request_timeout = parse_secs(&var, "LLM_REQUEST_TIMEOUT_SECS")?;

        Ok(config)
    }
}

fn parse_secs(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<Duration>, LlmClientError> {
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| LlmClientError::Config(format!("{name} must be whole seconds, got {raw:?}")))
        })
        .transpose()
}

#[derive(Debug, thiserror::Error)]
pub enum LlmClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid response JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("upstream returned error: status={status} message={message}")]
    Upstream { status: StatusCode, message: String },

    #[error("upstream returned non-JSON error: status={status} body={body}")]
    UpstreamBody { status: StatusCode, body: String },

    #[error("upstream reported an error mid-stream: {0}")]
    Stream(String),

    #[error("completion response carried no message content")]
    EmptyCompletion,

    #[error("hosted backend requires LLM_API_KEY (or HF_TOKEN) to be set")]
    MissingApiKey,

    #[error("invalid llm configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
}

#[derive(Clone)]
pub struct LlmClient {
    config: LlmClientConfig,
    http: reqwest::Client,
}

impl LlmClient {
    /// Fails fast when a hosted backend has no API key, so no unauthenticated request
    /// ever leaves the process.
    pub fn new(config: LlmClientConfig) -> Result<Self, LlmClientError> {
        if config.backend == LlmBackend::Hosted && config.api_key.is_none() {
            return Err(LlmClientError::MissingApiKey);
        }
        let http = reqwest::Client::builder()
            .user_agent("tutor-server")
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { config, http })
    }

    /// Send `history + [user prompt]` with streaming enabled and return the reply as a
    /// lazy token sequence. Nothing is read from the body until the caller polls.
    pub async fn stream_chat(
        &self,
        prompt: &str,
        history: &[Message],
    ) -> Result<TokenStream, LlmClientError> {
        let resp = self.send(prompt, history, true).await?;
        if !resp.status().is_success() {
            return Err(to_upstream_error(resp, self.config.max_error_body_bytes).await);
        }
        debug!(model = %self.config.model, "chat stream opened");
        Ok(TokenStream::from_response(resp))
    }

    /// Non-streaming fetch of the full reply for the same request shape.
    pub async fn complete(&self, prompt: &str, history: &[Message]) -> Result<String, LlmClientError> {
        let resp = self.send(prompt, history, false).await?;
        if !resp.status().is_success() {
            return Err(to_upstream_error(resp, self.config.max_error_body_bytes).await);
        }
        let body = resp.bytes().await?;
        let chunk: WireChunk = serde_json::from_slice(&body)?;
        chunk.into_content().ok_or(LlmClientError::EmptyCompletion)
    }

    /// Drain a streamed reply and return it with per-line whitespace trimmed.
    pub async fn get_clean_answer(
        &self,
        prompt: &str,
        history: &[Message],
    ) -> Result<String, LlmClientError> {
        let mut stream = self.stream_chat(prompt, history).await?;
        let mut raw = String::new();
        while let Some(token) = stream.next().await {
            raw.push_str(&token?);
        }
        Ok(clean_answer(&raw))
    }

    async fn send(
        &self,
        prompt: &str,
        history: &[Message],
        stream: bool,
    ) -> Result<reqwest::Response, LlmClientError> {
        let url = format!("{}{}", self.config.base_url, self.config.backend.chat_path());
        let mut messages = history.to_vec();
        messages.push(Message::user(prompt));
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            stream,
        };

        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(timeout) = self.config.request_timeout {
            req = req.timeout(timeout);
        }
        Ok(req.send().await?)
    }
}

/// Trim every line of an answer and rejoin with `\n`.
pub fn clean_answer(raw: &str) -> String {
    raw.lines().map(str::trim).collect::<Vec<_>>().join("\n")
}

/// Incremental reply tokens, in arrival order.
///
/// The decoder buffers bytes only up to the next newline; each complete line is decoded and
/// turned into zero or one token. Once the backend signals completion, or the stream errors,
/// the response body is dropped, which closes the connection. A consumer that stops early
/// calls [`TokenStream::close`]; dropping the stream unfinished closes it the same way.
pub struct TokenStream {
    body: Option<BoxStream<'static, Result<Vec<u8>, LlmClientError>>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, LlmClientError>>,
}

impl TokenStream {
    /// Decode tokens from any byte stream carrying NDJSON or SSE chat chunks.
    pub fn from_byte_stream<S>(bytes: S) -> Self
    where
        S: Stream<Item = Result<Vec<u8>, LlmClientError>> + Send + 'static,
    {
        Self {
            body: Some(bytes.boxed()),
            buffer: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn from_response(resp: reqwest::Response) -> Self {
        Self::from_byte_stream(
            resp.bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()).map_err(LlmClientError::from)),
        )
    }

    /// Stop consuming and close the underlying connection.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.body.take().is_some() {
            debug!(buffered = self.buffer.len(), "token stream closed before completion");
        }
        self.buffer.clear();
    }

    fn finish(&mut self) {
        self.body = None;
        self.buffer.clear();
    }

    fn drain_lines(&mut self) {
        while self.body.is_some() {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        match decode_line(&line) {
            StreamLine::Skip => {}
            StreamLine::Done => self.finish(),
            StreamLine::Content { token, done } => {
                if let Some(token) = token {
                    self.pending.push_back(Ok(token));
                }
                if done {
                    self.finish();
                }
            }
            StreamLine::Failed(message) => {
                self.pending.push_back(Err(LlmClientError::Stream(message)));
                self.finish();
            }
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl Stream for TokenStream {
    type Item = Result<String, LlmClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            let Some(body) = this.body.as_mut() else {
                return Poll::Ready(None);
            };
            match body.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                    this.drain_lines();
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finish();
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    // Body ended without a trailing newline or a done marker.
                    let rest = std::mem::take(&mut this.buffer);
                    if !rest.is_empty() {
                        this.handle_line(&rest);
                    }
                    this.finish();
                }
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum StreamLine {
    Skip,
    Done,
    Content { token: Option<String>, done: bool },
    Failed(String),
}

fn decode_line(line: &str) -> StreamLine {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
        return StreamLine::Skip;
    }
    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if payload == "[DONE]" {
        return StreamLine::Done;
    }

    let mut chunk: WireChunk = match serde_json::from_str(payload) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, line = payload, "failed to parse stream line, skipping");
            return StreamLine::Skip;
        }
    };

    if let Some(err) = chunk.error.take() {
        return StreamLine::Failed(err.into_message());
    }

    let done = chunk.done;
    let token = chunk.into_content().filter(|t| !t.is_empty());
    StreamLine::Content { token, done }
}

/// One decoded line: an Ollama chunk, an OpenAI delta chunk, or a full completion object.
#[derive(Debug, Default, Deserialize)]
struct WireChunk {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    /// Ollama `/api/generate` shape.
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Default, Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: Option<WireMessage>,
    #[serde(default)]
    message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

impl WireChunk {
    fn into_content(self) -> Option<String> {
        let WireChunk {
            message,
            choices,
            response,
            ..
        } = self;
        let first = choices.into_iter().next().unwrap_or_default();
        message
            .and_then(|m| m.content)
            .or_else(|| first.delta.and_then(|d| d.content))
            .or_else(|| first.message.and_then(|m| m.content))
            .or(response)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: WireError,
}

/// Backends report errors as a bare string or as an object with a `message`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireError {
    Text(String),
    Object { message: String },
    Other(Value),
}

impl WireError {
    fn into_message(self) -> String {
        match self {
            Self::Text(message) | Self::Object { message } => message,
            Self::Other(value) => value.to_string(),
        }
    }
}

async fn to_upstream_error(resp: reqwest::Response, max_error_body_bytes: usize) -> LlmClientError {
    let status = resp.status();
    let body = read_limited_text(resp, max_error_body_bytes).await;
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => LlmClientError::Upstream {
            status,
            message: envelope.error.into_message(),
        },
        Err(_) => LlmClientError::UpstreamBody { status, body },
    }
}

async fn read_limited_text(resp: reqwest::Response, max_bytes: usize) -> String {
    match resp.bytes().await {
        Ok(mut b) => {
            if b.len() > max_bytes {
                b.truncate(max_bytes);
            }
            String::from_utf8_lossy(&b).to_string()
        }
        Err(e) => {
            warn!(error = %e, "failed to read upstream error body");
            "<failed to read error body>".to_string()
        }
    }
}
