//! # Audio Frame Buffers
//!
//! `Audio` is the unit of audio data passed around the bridge: an immutable
//! block of PCM bytes tagged with the `AudioConfig` that describes it.
//!
//! ## Key Features:
//! - **Frame alignment**: the byte length is always a whole number of frames
//! - **Cheap clones**: data lives in `bytes::Bytes`, so cloning shares memory
//! - **Concatenation**: only between buffers with identical configuration
//! - **WAV export/import**: standard PCM WAV container (mono, 16-bit LE)
//! - **Realtime replay**: `stream_realtime` hands the buffer to the pacer

use crate::audio::format::AudioConfig;
use crate::audio::pacer;
use crate::error::{BridgeError, BridgeResult};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::io::Cursor;
use std::ops::Add;
use std::time::Duration;

/// Unit of audio data with its configuration.
///
/// ## Lifecycle:
/// Created by a producer (microphone capture, remote API decode, WAV file),
/// never mutated afterwards, consumed by playback or further concatenation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Audio {
    config: AudioConfig,
    data: Bytes,
}

impl Audio {
    /// Wrap PCM bytes.
    ///
    /// # Panics
    /// If the length is not a multiple of the frame size. Use
    /// [`Audio::try_new`] for data that has not been validated yet.
    pub fn new(config: AudioConfig, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        assert_eq!(
            data.len() % config.frame_size(),
            0,
            "audio length must be a whole number of frames"
        );
        Self { config, data }
    }

    /// Wrap PCM bytes coming from an untrusted producer.
    pub fn try_new(config: AudioConfig, data: impl Into<Bytes>) -> BridgeResult<Self> {
        let data = data.into();
        if data.len() % config.frame_size() != 0 {
            return Err(BridgeError::InvalidAudio(format!(
                "{} bytes is not a whole number of {}-byte frames",
                data.len(),
                config.frame_size()
            )));
        }
        Ok(Self { config, data })
    }

    /// An empty buffer.
    pub fn empty(config: AudioConfig) -> Self {
        Self {
            config,
            data: Bytes::new(),
        }
    }

    /// Silence lasting `length_seconds`.
    ///
    /// ## Calculation:
    /// frames = floor(length_seconds × sample_rate). Zero, negative and NaN
    /// durations produce an empty buffer.
    ///
    /// # Panics
    /// If the duration is infinite or too long to address in memory.
    pub fn silence(config: AudioConfig, length_seconds: f64) -> Self {
        let num_frames = if length_seconds > 0.0 {
            (length_seconds * config.sample_rate() as f64).floor() as usize
        } else {
            0
        };
        let len = num_frames
            .checked_mul(config.frame_size())
            .filter(|&len| len <= isize::MAX as usize)
            .unwrap_or_else(|| panic!("silence of {}s does not fit in memory", length_seconds));
        let data = BytesMut::zeroed(len);
        Self {
            config,
            data: data.freeze(),
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Raw PCM bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of frames in the buffer.
    pub fn frames(&self) -> usize {
        self.data.len() / self.config.frame_size()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.config.sample_rate() as f64)
    }

    /// Decode the PCM bytes into 16-bit samples.
    ///
    /// ## Rust Concepts:
    /// - **byteorder**: `read_i16_into` decodes little-endian pairs in one pass
    pub fn samples(&self) -> Vec<i16> {
        let mut samples = vec![0i16; self.data.len() / 2];
        LittleEndian::read_i16_into(&self.data, &mut samples);
        samples
    }

    /// Build a buffer from 16-bit samples.
    pub fn from_samples(config: AudioConfig, samples: &[i16]) -> Self {
        let mut data = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut data);
        Self::new(config, data)
    }

    /// Append `other` to this buffer.
    ///
    /// ## Errors:
    /// `BridgeError::ConfigMismatch` if the two configurations differ.
    pub fn concat(&self, other: &Audio) -> BridgeResult<Audio> {
        if self.config != other.config {
            return Err(BridgeError::ConfigMismatch {
                left: self.config.to_string(),
                right: other.config.to_string(),
            });
        }
        let mut data = BytesMut::with_capacity(self.data.len() + other.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&other.data);
        Ok(Audio {
            config: self.config,
            data: data.freeze(),
        })
    }

    /// Encode as a PCM WAV file.
    pub fn to_wav_bytes(&self) -> BridgeResult<Vec<u8>> {
        let header = wav::Header::new(
            wav::WAV_FORMAT_PCM,
            self.config.channels(),
            self.config.sample_rate(),
            16,
        );
        let track = wav::BitDepth::Sixteen(self.samples());
        let mut out = Cursor::new(Vec::with_capacity(self.data.len() + 44));
        wav::write(header, &track, &mut out)?;
        Ok(out.into_inner())
    }

    /// Parse a PCM WAV file.
    ///
    /// Only mono 16-bit files are accepted; anything else is reported as
    /// `BridgeError::InvalidAudio` rather than resampled.
    pub fn from_wav_bytes(bytes: &[u8]) -> BridgeResult<Audio> {
        let (header, track) = wav::read(&mut Cursor::new(bytes))?;
        if header.channel_count != 1 {
            return Err(BridgeError::InvalidAudio(format!(
                "expected mono WAV, got {} channels",
                header.channel_count
            )));
        }
        if header.sampling_rate == 0 {
            return Err(BridgeError::InvalidAudio("WAV sample rate is zero".to_string()));
        }
        match track {
            wav::BitDepth::Sixteen(samples) => Ok(Audio::from_samples(
                AudioConfig::new(header.sampling_rate),
                &samples,
            )),
            _ => Err(BridgeError::InvalidAudio(format!(
                "expected 16-bit WAV, got {} bits per sample",
                header.bits_per_sample
            ))),
        }
    }

    /// Replay this buffer as if a live device were consuming it.
    ///
    /// See [`pacer::pace`] for the timing rules.
    pub fn stream_realtime(&self, expected_delta: Duration) -> impl Stream<Item = Bytes> {
        pacer::pace(self.clone(), expected_delta)
    }
}

/// `a + b` concatenates two buffers.
///
/// # Panics
/// If the configurations differ; use [`Audio::concat`] to get an error instead.
impl Add for Audio {
    type Output = Audio;

    fn add(self, other: Audio) -> Audio {
        match self.concat(&other) {
            Ok(audio) => audio,
            Err(e) => panic!("cannot add audio with different configs: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(config: AudioConfig, start: i16, len: usize) -> Audio {
        let samples: Vec<i16> = (0..len as i16).map(|i| start.wrapping_add(i * 37)).collect();
        Audio::from_samples(config, &samples)
    }

    #[test]
    fn test_concat_preserves_samples() {
        let config = AudioConfig::new(16000);
        let a = ramp(config, -1200, 50);
        let b = ramp(config, 900, 17);

        let joined = a.concat(&b).unwrap();
        let mut expected = a.samples();
        expected.extend(b.samples());
        assert_eq!(joined.samples(), expected);
        assert_eq!(joined.frames(), 67);

        let added = a + b;
        assert_eq!(added, joined);
    }

    #[test]
    fn test_concat_config_mismatch() {
        let a = Audio::silence(AudioConfig::new(16000), 0.1);
        let b = Audio::silence(AudioConfig::new(24000), 0.1);

        match a.concat(&b) {
            Err(BridgeError::ConfigMismatch { left, right }) => {
                assert!(left.starts_with("16000"));
                assert!(right.starts_with("24000"));
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    #[should_panic(expected = "cannot add audio with different configs")]
    fn test_add_config_mismatch_panics() {
        let _ = Audio::silence(AudioConfig::new(16000), 0.1)
            + Audio::silence(AudioConfig::new(8000), 0.1);
    }

    #[test]
    #[should_panic(expected = "does not fit in memory")]
    fn test_infinite_silence_panics_clearly() {
        let _ = Audio::silence(AudioConfig::new(16000), f64::INFINITY);
    }

    #[test]
    #[should_panic(expected = "does not fit in memory")]
    fn test_huge_silence_panics_clearly() {
        let _ = Audio::silence(AudioConfig::new(16000), f64::MAX);
    }

    #[test]
    fn test_silence_lengths() {
        let config = AudioConfig::new(16000);
        assert!(Audio::silence(config, 0.0).is_empty());
        assert!(Audio::silence(config, -2.5).is_empty());
        assert!(Audio::silence(config, f64::NAN).is_empty());

        let three_seconds = Audio::silence(config, 3.0);
        assert_eq!(three_seconds.frames(), 48000);
        assert_eq!(three_seconds.len(), 96000);
        assert!(three_seconds.samples().iter().all(|&s| s == 0));

        // floor(0.0101 * 16000) = floor(161.6) = 161
        assert_eq!(Audio::silence(config, 0.0101).frames(), 161);
        assert_eq!(Audio::silence(AudioConfig::new(24000), 1.5).duration(), Duration::from_millis(1500));
    }

    #[test]
    fn test_try_new_rejects_partial_frames() {
        let config = AudioConfig::new(16000);
        assert!(Audio::try_new(config, vec![0u8; 3]).is_err());
        assert_eq!(Audio::try_new(config, vec![0u8; 4]).unwrap().frames(), 2);
    }

    #[test]
    fn test_wav_export_header() {
        let audio = ramp(AudioConfig::new(24000), 0, 100);
        let wav_bytes = audio.to_wav_bytes().unwrap();

        assert_eq!(&wav_bytes[0..4], b"RIFF");
        assert_eq!(&wav_bytes[8..12], b"WAVE");
        assert!(wav_bytes.len() >= 44 + audio.len());

        let parsed = Audio::from_wav_bytes(&wav_bytes).unwrap();
        assert_eq!(parsed.config().sample_rate(), 24000);
        assert_eq!(parsed.samples(), audio.samples());
    }

    #[test]
    fn test_wav_import_rejects_garbage() {
        assert!(Audio::from_wav_bytes(b"definitely not a wav file").is_err());
    }
}
