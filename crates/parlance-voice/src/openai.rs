//! OpenAI-compatible streaming chat completions.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::VoiceError;
use crate::service::{LanguageModel, ModelEvent, ModelRequest, ModelStream};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Buffered deltas between the HTTP reader task and the responder.
const STREAM_BUFFER: usize = 64;

/// Chat-completions client speaking server-sent events.
#[derive(Clone)]
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiChat {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl std::fmt::Debug for OpenAiChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChat")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[redacted]")
            .finish()
    }
}

/// Builds the JSON body for a streaming completion.
pub fn request_body(model: &str, request: &ModelRequest) -> Value {
    let mut messages = Vec::with_capacity(request.history.len() + 1);
    if !request.system_prompt.is_empty() {
        messages.push(json!({ "role": "system", "content": request.system_prompt }));
    }
    messages.extend(
        request
            .history
            .iter()
            .map(|turn| json!({ "role": turn.role.as_str(), "content": turn.content })),
    );

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": true,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.clone());
    }
    body
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Incremental parser for an SSE body.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; only complete
/// lines are interpreted.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Consumes a body chunk and returns the events completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<ModelEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                events.push(ModelEvent::Done);
                break;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    if let Some(content) = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content)
                        .filter(|content| !content.is_empty())
                    {
                        events.push(ModelEvent::Content(content));
                    }
                }
                Err(e) => debug!(error = %e, "skipping unparseable SSE chunk"),
            }
        }
        events
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    fn validate(&self) -> Result<(), VoiceError> {
        if self.api_key.trim().is_empty() {
            return Err(VoiceError::MissingCredentials(
                "language model API key (OPENAI_API_KEY)".to_string(),
            ));
        }
        Ok(())
    }

    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, VoiceError> {
        self.validate()?;
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request_body(&self.model, &request))
            .send()
            .await
            .map_err(|e| VoiceError::Model(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(VoiceError::Model(format!("HTTP {status}: {text}")));
        }

        let (tx, rx) = mpsc::channel::<Result<ModelEvent, VoiceError>>(STREAM_BUFFER);
        let model = self.model.clone();
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            loop {
                match body.try_next().await {
                    Ok(Some(bytes)) => {
                        for event in decoder.push(&bytes) {
                            // Receiver gone: the turn was abandoned.
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                        if decoder.is_done() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Ok(ModelEvent::Done)).await;
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, model = %model, "model stream interrupted");
                        let _ = tx.send(Err(VoiceError::Model(e.to_string()))).await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
