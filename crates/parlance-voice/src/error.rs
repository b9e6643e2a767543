use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    /// A required API key is absent. Fatal to session start.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("audio codec error: {0}")]
    Codec(#[from] base64::DecodeError),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("link closed")]
    Closed,
}
