//! # Audio Module
//!
//! PCM audio types and the audio protocol spoken over the relay.
//!
//! ## Key Components:
//! - **Format**: sample format and [`AudioConfig`]
//! - **Audio Buffer**: immutable PCM frames with a fixed config
//! - **Pacer**: replays an [`Audio`] buffer as if captured live
//! - **Session**: base64 PCM in both directions plus start signalling
//!
//! ## Audio Format Requirements:
//! - **Bit Depth**: 16-bit PCM, little-endian signed integers
//! - **Channels**: Mono (1 channel)
//! - **Sample Rate**: any positive rate, 16kHz by convention

pub mod buffer; // Immutable PCM frames
pub mod format; // Sample format and stream config
pub mod pacer; // Realtime playback
pub mod session; // Audio protocol over the relay

pub use buffer::Audio;
pub use format::{AudioConfig, SampleFormat, STANDARD_AUDIO_CONFIG};
pub use pacer::DEFAULT_EXPECTED_DELTA;
pub use session::{AudioSession, LiveAudio, SessionStats};
