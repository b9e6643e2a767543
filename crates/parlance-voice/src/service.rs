//! Seams between the pipeline and the hosted speech and language services.
//!
//! Each service is a trait object so the pipeline can run against the
//! Deepgram/OpenAI adapters in production and scripted fakes in tests.
//! Links are plain unbounded channels: writing audio or text never blocks the
//! caller, and the adapter owns the socket on the other side.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use parlance_types::{AudioFormat, ConversationTurn};
use tokio::sync::mpsc;

use crate::error::VoiceError;

/// Parameters for one speech-recognition connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SttSettings {
    pub model: String,
    pub locale: String,
    pub format: AudioFormat,
    /// Silence, in milliseconds, after which the service reports an utterance end.
    pub utterance_end_ms: u32,
    /// Silence, in milliseconds, after which a transcript is finalized.
    pub endpointing_ms: u32,
}

/// Client-to-service frames on a recognition link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttFrame {
    Audio(Vec<u8>),
    /// Ask the service to flush and close.
    Finish,
}

/// Service-to-client events on a recognition link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    Transcript { text: String, is_final: bool },
    /// End of speech detected without regard to finals.
    UtteranceEnd,
    Error(String),
    /// The link is gone; no more events follow.
    Closed,
}

/// An open recognition link.
#[derive(Debug)]
pub struct SttLink {
    pub frames: mpsc::UnboundedSender<SttFrame>,
    pub events: mpsc::UnboundedReceiver<SttEvent>,
}

/// A streaming speech-to-text service.
#[async_trait]
pub trait SttTransport: Send + Sync {
    /// Checks static configuration such as credentials.
    fn validate(&self) -> Result<(), VoiceError> {
        Ok(())
    }

    /// Opens a link. Resolving the future is the service's open acknowledgement.
    async fn open(&self, settings: &SttSettings) -> Result<SttLink, VoiceError>;
}

/// Parameters for one synthesis connection.
#[derive(Debug, Clone, PartialEq)]
pub struct TtsSettings {
    pub model: String,
    pub voice: Option<String>,
    pub format: AudioFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsCommand {
    Speak(String),
    Flush,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsEvent {
    Audio(Vec<u8>),
    /// All text sent before the last flush has been synthesized.
    Flushed,
    Error(String),
    Closed,
}

/// An open synthesis link.
#[derive(Debug)]
pub struct TtsLink {
    pub commands: mpsc::UnboundedSender<TtsCommand>,
    pub events: mpsc::UnboundedReceiver<TtsEvent>,
}

/// A streaming text-to-speech service.
#[async_trait]
pub trait TtsTransport: Send + Sync {
    fn validate(&self) -> Result<(), VoiceError> {
        Ok(())
    }

    async fn open(&self, settings: &TtsSettings) -> Result<TtsLink, VoiceError>;
}

/// One request to the language model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system_prompt: String,
    /// Prior turns followed by the new user utterance.
    pub history: Vec<ConversationTurn>,
    /// Tool definitions forwarded verbatim.
    pub tools: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    Content(String),
    Done,
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, VoiceError>> + Send>>;

/// A streaming text-generation service.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn validate(&self) -> Result<(), VoiceError> {
        Ok(())
    }

    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, VoiceError>;
}

/// The three services one pipeline talks to.
#[derive(Clone)]
pub struct VoiceServices {
    pub stt: Arc<dyn SttTransport>,
    pub tts: Arc<dyn TtsTransport>,
    pub model: Arc<dyn LanguageModel>,
}

impl VoiceServices {
    /// Validates all three services, reporting the first failure.
    pub fn validate(&self) -> Result<(), VoiceError> {
        self.stt.validate()?;
        self.tts.validate()?;
        self.model.validate()
    }
}

impl std::fmt::Debug for VoiceServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceServices").finish_non_exhaustive()
    }
}
