//! Deepgram-compatible streaming speech adapters.
//!
//! Both adapters speak the provider's WebSocket protocol: raw audio in binary
//! frames and JSON control messages in text frames. Each link runs a writer
//! task and a reader task that bridge the socket to the link channels.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::error::VoiceError;
use crate::service::{
    SttEvent, SttFrame, SttLink, SttSettings, SttTransport, TtsCommand, TtsEvent, TtsLink,
    TtsSettings, TtsTransport,
};

pub const DEFAULT_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";
pub const DEFAULT_SPEAK_URL: &str = "wss://api.deepgram.com/v1/speak";

/// The listen endpoint closes idle sockets after about ten seconds.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Streaming recognition over the `listen` endpoint.
#[derive(Clone)]
pub struct DeepgramStt {
    url: String,
    api_key: String,
}

impl DeepgramStt {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }

    /// Endpoint URL with the recognition parameters for `settings`.
    pub fn listen_url(&self, settings: &SttSettings) -> Result<Url, VoiceError> {
        let mut url = parse_service_url(&self.url)?;
        url.query_pairs_mut()
            .append_pair("model", &settings.model)
            .append_pair("encoding", settings.format.encoding.as_str())
            .append_pair("sample_rate", &settings.format.sample_rate.to_string())
            .append_pair("channels", "1")
            .append_pair("language", &settings.locale)
            .append_pair("interim_results", "true")
            .append_pair("utterance_end_ms", &settings.utterance_end_ms.to_string())
            .append_pair("endpointing", &settings.endpointing_ms.to_string())
            .append_pair("vad_events", "true")
            .append_pair("smart_format", "true");
        Ok(url)
    }
}

impl std::fmt::Debug for DeepgramStt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepgramStt")
            .field("url", &self.url)
            .field("api_key", &"[redacted]")
            .finish()
    }
}

#[async_trait]
impl SttTransport for DeepgramStt {
    fn validate(&self) -> Result<(), VoiceError> {
        require_key(&self.api_key)
    }

    async fn open(&self, settings: &SttSettings) -> Result<SttLink, VoiceError> {
        self.validate()?;
        let request = authorized_request(&self.listen_url(settings)?, &self.api_key)?;
        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| VoiceError::Connection(format!("listen: {e}")))?;
        let (mut sink, mut stream) = socket.split();

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<SttFrame>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;
            loop {
                tokio::select! {
                    frame = frame_rx.recv() => match frame {
                        Some(SttFrame::Audio(chunk)) => {
                            if sink.send(Message::Binary(chunk.into())).await.is_err() {
                                break;
                            }
                            keepalive.reset();
                        }
                        Some(SttFrame::Finish) | None => {
                            let close = json!({ "type": "CloseStream" }).to_string();
                            let _ = sink.send(Message::Text(close.into())).await;
                            break;
                        }
                    },
                    _ = keepalive.tick() => {
                        let ping = json!({ "type": "KeepAlive" }).to_string();
                        if sink.send(Message::Text(ping.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_listen_message(&text) {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "listen socket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = event_tx.send(SttEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            let _ = event_tx.send(SttEvent::Closed);
        });

        Ok(SttLink {
            frames: frame_tx,
            events: event_rx,
        })
    }
}

/// Maps one `listen` text message to a link event.
///
/// Metadata and speech-start notices yield `None`.
pub fn parse_listen_message(text: &str) -> Option<SttEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "unparseable listen message");
            return None;
        }
    };

    match value.get("type").and_then(Value::as_str)? {
        "Results" => {
            let text = value
                .pointer("/channel/alternatives/0/transcript")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let is_final = value
                .get("is_final")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Some(SttEvent::Transcript { text, is_final })
        }
        "UtteranceEnd" => Some(SttEvent::UtteranceEnd),
        "Error" => Some(SttEvent::Error(error_description(&value))),
        _ => None,
    }
}

/// Streaming synthesis over the `speak` endpoint.
#[derive(Clone)]
pub struct DeepgramTts {
    url: String,
    api_key: String,
}

impl DeepgramTts {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }

    /// Endpoint URL for `settings`. A configured voice takes precedence over
    /// the model name.
    pub fn speak_url(&self, settings: &TtsSettings) -> Result<Url, VoiceError> {
        let model = settings.voice.as_deref().unwrap_or(&settings.model);
        let mut url = parse_service_url(&self.url)?;
        url.query_pairs_mut()
            .append_pair("model", model)
            .append_pair("encoding", settings.format.encoding.as_str())
            .append_pair("sample_rate", &settings.format.sample_rate.to_string());
        Ok(url)
    }
}

impl std::fmt::Debug for DeepgramTts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepgramTts")
            .field("url", &self.url)
            .field("api_key", &"[redacted]")
            .finish()
    }
}

#[async_trait]
impl TtsTransport for DeepgramTts {
    fn validate(&self) -> Result<(), VoiceError> {
        require_key(&self.api_key)
    }

    async fn open(&self, settings: &TtsSettings) -> Result<TtsLink, VoiceError> {
        self.validate()?;
        let request = authorized_request(&self.speak_url(settings)?, &self.api_key)?;
        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| VoiceError::Connection(format!("speak: {e}")))?;
        let (mut sink, mut stream) = socket.split();

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<TtsCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let close = matches!(command, TtsCommand::Close);
                let body = match command {
                    TtsCommand::Speak(text) => json!({ "type": "Speak", "text": text }),
                    TtsCommand::Flush => json!({ "type": "Flush" }),
                    TtsCommand::Close => json!({ "type": "Close" }),
                };
                if sink.send(Message::Text(body.to_string().into())).await.is_err() {
                    break;
                }
                if close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let event = match message {
                    // Copy exactly the frame payload, never a pooled buffer.
                    Ok(Message::Binary(payload)) => Some(TtsEvent::Audio(payload.to_vec())),
                    Ok(Message::Text(text)) => parse_speak_message(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => None,
                    Err(e) => Some(TtsEvent::Error(e.to_string())),
                };
                let Some(event) = event else { continue };
                let fatal = matches!(event, TtsEvent::Error(_));
                if event_tx.send(event).is_err() || fatal {
                    return;
                }
            }
            let _ = event_tx.send(TtsEvent::Closed);
        });

        Ok(TtsLink {
            commands: command_tx,
            events: event_rx,
        })
    }
}

/// Maps one `speak` text message to a link event.
pub fn parse_speak_message(text: &str) -> Option<TtsEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    match value.get("type").and_then(Value::as_str)? {
        "Flushed" => Some(TtsEvent::Flushed),
        "Error" => Some(TtsEvent::Error(error_description(&value))),
        "Warning" => {
            warn!(warning = %error_description(&value), "speak warning");
            None
        }
        _ => None,
    }
}

fn error_description(value: &Value) -> String {
    ["description", "err_msg", "message"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or("unknown provider error")
        .to_string()
}

fn require_key(api_key: &str) -> Result<(), VoiceError> {
    if api_key.trim().is_empty() {
        return Err(VoiceError::MissingCredentials(
            "speech API key (DEEPGRAM_API_KEY)".to_string(),
        ));
    }
    Ok(())
}

fn parse_service_url(base: &str) -> Result<Url, VoiceError> {
    Url::parse(base).map_err(|e| VoiceError::Config(format!("invalid service url {base}: {e}")))
}

fn authorized_request(url: &Url, api_key: &str) -> Result<Request<()>, VoiceError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| VoiceError::Config(format!("invalid service url {url}: {e}")))?;
    let token = HeaderValue::from_str(&format!("Token {api_key}"))
        .map_err(|_| VoiceError::Config("API key is not a valid header value".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, token);
    Ok(request)
}
