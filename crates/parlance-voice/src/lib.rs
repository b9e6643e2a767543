//! Real-time voice conversation pipeline for Parlance.
//!
//! Bridges a caller's audio stream to streaming speech recognition, a
//! turn-based language-model responder, and streaming speech synthesis,
//! with barge-in and usage accounting.
//!
//! The hosted services sit behind the traits in [`service`]; production
//! adapters live in [`deepgram`] and [`openai`]. The pipeline itself is
//! transport-agnostic: a session host feeds it raw audio and receives output
//! through a [`PipelineSink`].

pub mod codec;
pub mod deepgram;
pub mod epoch;
pub mod error;
pub mod openai;
pub mod pipeline;
pub mod responder;
pub mod service;
pub mod stt;
pub mod tts;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use codec::{decode_base64_audio, encode_base64_audio};
pub use deepgram::{DeepgramStt, DeepgramTts};
pub use epoch::{EpochClock, TurnGuard};
pub use error::VoiceError;
pub use openai::OpenAiChat;
pub use pipeline::{PipelineOptions, PipelinePhase, PipelineSink, VoicePipeline};
pub use responder::TurnResponder;
pub use service::{
    LanguageModel, ModelEvent, ModelRequest, ModelStream, SttEvent, SttFrame, SttLink,
    SttSettings, SttTransport, TtsCommand, TtsEvent, TtsLink, TtsSettings, TtsTransport,
    VoiceServices,
};
pub use stt::{SttClient, SttState};
pub use tts::{SpeakOutcome, TtsClient};
