//! # Audio Stream Configuration
//!
//! Describes the PCM layout shared by both ends of the bridge.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: any positive rate (16kHz capture, 24kHz live playback)
//! - **Bit Depth**: 16-bit PCM, little-endian signed (`S16_LE`)
//! - **Channels**: Mono (1 channel)
//!
//! The format and channel count are fixed. Constructing a configuration with
//! anything else is a programming error and panics immediately.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// PCM sample encodings understood by the bridge.
///
/// Only one encoding exists today; the enum keeps the wire name in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 16-bit signed little-endian samples.
    #[default]
    #[serde(rename = "S16_LE")]
    S16Le,
}

impl SampleFormat {
    /// Bytes per single-channel sample.
    pub fn sample_size(&self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SampleFormat::S16Le => "S16_LE",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S16_LE" | "s16_le" | "s16le" => Ok(SampleFormat::S16Le),
            _ => Err(format!("Unsupported sample format: {}", s)),
        }
    }
}

/// Configuration of an audio stream.
///
/// ## Rust Concepts:
/// - **Copy**: the struct is three small integers, so it is passed by value
/// - **Private fields**: callers go through the constructors, which enforce
///   the mono `S16_LE` contract
///
/// ## Derived sizes:
/// - `sample_size()` is always 2 bytes
/// - `frame_size()` = channels × sample_size = 2 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioConfig {
    sample_rate: u32,
    format: SampleFormat,
    channels: u16,
}

/// 16kHz mono `S16_LE`, the capture format the browser worklet produces by default.
pub const STANDARD_AUDIO_CONFIG: AudioConfig = AudioConfig {
    sample_rate: 16000,
    format: SampleFormat::S16Le,
    channels: 1,
};

impl AudioConfig {
    /// Mono `S16_LE` at the given sample rate.
    ///
    /// # Panics
    /// If `sample_rate` is zero.
    pub fn new(sample_rate: u32) -> Self {
        Self::with_layout(sample_rate, SampleFormat::S16Le, 1)
    }

    /// Fully specified constructor.
    ///
    /// # Panics
    /// If `sample_rate` is zero or `channels` is not 1. Other layouts are a
    /// contract violation, not a recoverable condition.
    pub fn with_layout(sample_rate: u32, format: SampleFormat, channels: u16) -> Self {
        assert!(sample_rate > 0, "sample rate must be positive");
        assert_eq!(channels, 1, "only mono audio is supported");
        assert_eq!(format, SampleFormat::S16Le, "only S16_LE audio is supported");
        Self {
            sample_rate,
            format,
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Bytes per sample of one channel.
    pub fn sample_size(&self) -> usize {
        self.format.sample_size()
    }

    /// Bytes per frame (one sample for every channel).
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.sample_size()
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_size()
    }

    /// MIME type the live API expects for raw PCM input.
    pub fn pcm_mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        STANDARD_AUDIO_CONFIG
    }
}

impl fmt::Display for AudioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}/{}ch",
            self.sample_rate, self.format, self.channels
        )
    }
}
