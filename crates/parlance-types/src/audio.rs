//! Audio format descriptors.
//!
//! The pipeline never transcodes. Formats are carried through to the speech
//! services and used for usage accounting (bytes to seconds).

use serde::{Deserialize, Serialize};

/// Sample encoding of a raw audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM.
    #[default]
    Linear16,
    /// G.711 mu-law, one byte per sample.
    Mulaw,
}

impl AudioEncoding {
    /// Returns the name used by the speech services.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linear16 => "linear16",
            Self::Mulaw => "mulaw",
        }
    }

    /// Bytes per mono sample.
    pub fn bytes_per_sample(self) -> u32 {
        match self {
            Self::Linear16 => 2,
            Self::Mulaw => 1,
        }
    }
}

/// Encoding plus sample rate for one direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
}

impl AudioFormat {
    pub const fn new(encoding: AudioEncoding, sample_rate: u32) -> Self {
        Self {
            encoding,
            sample_rate,
        }
    }

    /// 8 kHz mu-law, the usual telephone format.
    pub const fn telephony() -> Self {
        Self::new(AudioEncoding::Mulaw, 8_000)
    }

    /// 16-bit PCM at the given rate, the usual browser format.
    pub const fn linear16(sample_rate: u32) -> Self {
        Self::new(AudioEncoding::Linear16, sample_rate)
    }

    /// Mono byte rate of this format.
    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * u64::from(self.encoding.bytes_per_sample())
    }

    /// Converts a byte count in this format into seconds of audio.
    ///
    /// Returns `0.0` for a zero sample rate.
    pub fn bytes_to_seconds(&self, bytes: u64) -> f64 {
        let rate = self.bytes_per_second();
        if rate == 0 {
            return 0.0;
        }
        bytes as f64 / rate as f64
    }
}

/// Inbound (caller to agent) and outbound (agent to caller) formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormats {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

impl AudioFormats {
    pub const fn telephony() -> Self {
        Self {
            input: AudioFormat::telephony(),
            output: AudioFormat::telephony(),
        }
    }

    pub const fn browser(input_rate: u32, output_rate: u32) -> Self {
        Self {
            input: AudioFormat::linear16(input_rate),
            output: AudioFormat::linear16(output_rate),
        }
    }
}
