//! Shared types for the Parlance voice platform.
//!
//! This crate holds the data model that every other crate in the workspace
//! agrees on: audio formats, conversation turns, per-session voice
//! configuration, and usage snapshots. It performs no I/O.
//!
//! No crate in the workspace depends on anything *except* `parlance-types`
//! for cross-cutting type definitions, which keeps the dependency graph
//! acyclic.

pub mod audio;
pub mod voice;

pub use audio::{AudioEncoding, AudioFormat, AudioFormats};
pub use voice::{VoiceConfig, DEFAULT_AGENT_ID};

use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The caller.
    User,
    /// The agent.
    Assistant,
}

impl Role {
    /// Returns the lowercase label used on the wire and in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A single entry in the in-memory conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Point-in-time copy of a session's usage counters.
///
/// Counters only ever grow during a session; a snapshot taken later is always
/// greater than or equal to one taken earlier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Raw inbound audio bytes handed to the pipeline.
    pub audio_bytes: u64,
    /// `audio_bytes` converted to seconds using the inbound [`AudioFormat`].
    pub stt_seconds: f64,
    /// Characters submitted for synthesis.
    pub tts_characters: u64,
}

/// The physical transport a session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Telephony media stream (JSON envelopes, base64 mu-law at 8 kHz).
    Telephony,
    /// Browser socket (raw binary 16-bit PCM frames).
    Browser,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telephony => "telephony",
            Self::Browser => "browser",
        }
    }
}
