//! Per-session voice configuration.
//!
//! A `VoiceConfig` is resolved once when a session starts and is immutable
//! for the lifetime of that session's pipeline.

use serde::{Deserialize, Serialize};

/// Agent identifier used by [`VoiceConfig::fallback`].
pub const DEFAULT_AGENT_ID: &str = "default";

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_barge_in() -> bool {
    true
}

fn default_stt_model() -> String {
    "nova-2".to_string()
}

fn default_tts_model() -> String {
    "aura-asteria-en".to_string()
}

/// Agent identity, prompt and speech settings for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Identifier of the owning agent.
    pub agent_id: String,
    /// Name the agent introduces itself with.
    pub display_name: String,
    /// System prompt handed to the language model on every turn.
    pub system_prompt: String,
    /// BCP-47 locale passed to speech recognition.
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Whether caller speech may interrupt agent playback.
    #[serde(default = "default_barge_in")]
    pub barge_in: bool,
    /// Speech recognition model name.
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    /// Speech synthesis model name.
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    /// Optional synthesis voice identifier.
    #[serde(default)]
    pub tts_voice: Option<String>,
    /// Tool definitions (JSON schema objects) forwarded to the model.
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
}

impl VoiceConfig {
    /// The static configuration used when the agent lookup fails, is missing,
    /// or does not answer in time. A call is never refused for lack of it.
    pub fn fallback() -> Self {
        Self {
            agent_id: DEFAULT_AGENT_ID.to_string(),
            display_name: "Assistant".to_string(),
            system_prompt: "You are a friendly voice assistant on a phone call. \
                            Keep answers short and conversational, one or two sentences, \
                            and never use markdown or lists."
                .to_string(),
            locale: default_locale(),
            barge_in: default_barge_in(),
            stt_model: default_stt_model(),
            tts_model: default_tts_model(),
            tts_voice: None,
            tools: Vec::new(),
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self::fallback()
    }
}
