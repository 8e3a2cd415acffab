//! # Configuration Management
//!
//! This module handles loading and managing the bridge configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: converts between these structs and the layered `config` values
//! - **Nested structs**: one struct per concern (relay, pacer, device, live API)
//! - **Result<T, E>**: loading and validation report problems instead of panicking
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GOOGLE_API_KEY` (special case for the live API key)
//! 2. Environment variables (APP_MODE, APP_BRIDGE__SAMPLE_RATE, APP_LIVE__MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore in the environment, so field names
//! that contain underscores (`poll_interval_ms`) stay intact.

use crate::audio::{AudioConfig, SampleFormat};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What the binary does once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Emulated device only: microphone audio is echoed back to the speaker.
    #[default]
    Loopback,
    /// Emulated device talking to the remote live API.
    Live,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "loopback" | "echo" => Ok(RunMode::Loopback),
            "live" => Ok(RunMode::Live),
            _ => Err(format!("Unknown run mode: {}", s)),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Loopback => write!(f, "loopback"),
            RunMode::Live => write!(f, "live"),
        }
    }
}

/// Top-level configuration.
///
/// ## Rust Concepts:
/// - **#[derive(Serialize, Deserialize)]**: lets `config` build this struct
///   from defaults, files and environment in one pass
/// - **pub fields**: plain data, read directly by `main`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub mode: RunMode,
    pub bridge: BridgeConfig,
    pub pacer: PacerConfig,
    pub device: DeviceConfig,
    pub live: LiveConfig,
}

/// Relay and audio stream settings.
///
/// ## Fields:
/// - `poll_interval_ms`: delay between two relay poll cycles (latency floor)
/// - `sample_rate`: PCM sample rate shared by microphone and speaker
/// - `channels`: must be 1
/// - `sample_format`: must be `"S16_LE"`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub poll_interval_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: String,
}

/// Realtime pacer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacerConfig {
    /// Sleep between two emitted chunks
    pub expected_delta_ms: u64,
}

/// Emulated device settings.
///
/// ## Fields:
/// - `input_wav`: WAV file used as the microphone; no microphone if unset
/// - `output_wav`: where the speaker recording is written
/// - `require_input`: report `failed_to_start` when there is no input
/// - `tail_ms`: loopback keeps running this long after the input ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub input_wav: Option<String>,
    pub output_wav: String,
    pub require_input: bool,
    pub tail_ms: u64,
}

/// Remote live API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub host: String,
    pub model: String,
    /// Usually supplied through `GOOGLE_API_KEY`
    pub api_key: Option<String>,
    /// Sent as the first user turn; empty disables it
    pub initial_request_text: String,
    /// Directory receiving one WAV file per completed model turn
    pub turns_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Loopback,
            bridge: BridgeConfig {
                poll_interval_ms: 100,
                sample_rate: 16000,
                channels: 1,
                sample_format: SampleFormat::S16Le.to_string(),
            },
            pacer: PacerConfig {
                expected_delta_ms: 100,
            },
            device: DeviceConfig {
                input_wav: None,
                output_wav: "recording.wav".to_string(),
                require_input: false,
                tail_ms: 1000,
            },
            live: LiveConfig {
                host: crate::live::DEFAULT_HOST.to_string(),
                model: "models/gemini-live-2.5-flash-preview".to_string(),
                api_key: None,
                initial_request_text: "You are a helpful translation chatbot. Help beginners learn how to pronounce a word they say in the native language in Hebrew.".to_string(),
                turns_dir: "turns".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Take the live API key from `GOOGLE_API_KEY` when set
    ///
    /// ## Environment Variable Examples:
    /// - `APP_MODE=live`: talk to the live API
    /// - `APP_BRIDGE__SAMPLE_RATE=24000`: change the stream rate
    /// - `APP_DEVICE__INPUT_WAV=hello.wav`: use a WAV file as microphone
    /// - `GOOGLE_API_KEY=...`: live API key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(api_key) = env::var("GOOGLE_API_KEY") {
            settings = settings.set_override("live.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Poll interval, pacer delta and sample rate are not zero
    /// - The stream layout is mono `S16_LE`
    /// - Live mode has an API key and a model
    pub fn validate(&self) -> Result<()> {
        if self.bridge.poll_interval_ms == 0 {
            return Err(anyhow!("Poll interval must be greater than 0"));
        }

        if self.pacer.expected_delta_ms == 0 {
            return Err(anyhow!("Pacer delta must be greater than 0"));
        }

        self.audio_config()?;

        if self.mode == RunMode::Live {
            if self.live.api_key.as_deref().map_or(true, str::is_empty) {
                return Err(anyhow!(
                    "Live mode needs an API key (GOOGLE_API_KEY or APP_LIVE__API_KEY)"
                ));
            }
            if self.live.model.is_empty() {
                return Err(anyhow!("Live mode needs a model name"));
            }
        }

        Ok(())
    }

    /// The stream configuration, checked without panicking.
    pub fn audio_config(&self) -> Result<AudioConfig> {
        let format = SampleFormat::from_str(&self.bridge.sample_format)
            .map_err(|e| anyhow!(e))
            .context("Invalid sample format")?;
        if self.bridge.sample_rate == 0 {
            return Err(anyhow!("Sample rate must be greater than 0"));
        }
        if self.bridge.channels != 1 {
            return Err(anyhow!(
                "Only mono audio is supported, got {} channels",
                self.bridge.channels
            ));
        }
        Ok(AudioConfig::with_layout(
            self.bridge.sample_rate,
            format,
            self.bridge.channels,
        ))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.bridge.poll_interval_ms)
    }

    pub fn expected_delta(&self) -> Duration {
        Duration::from_millis(self.pacer.expected_delta_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.mode, RunMode::Loopback);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.audio_config().unwrap(), AudioConfig::new(16000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.bridge.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pacer.expected_delta_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.sample_rate = 0;
        assert!(config.validate().is_err());
    }

    /// Unsupported layouts are configuration errors, not panics.
    #[test]
    fn test_layout_rejected() {
        let mut config = AppConfig::default();
        config.bridge.channels = 2;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.sample_format = "F32_LE".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_live_mode_needs_api_key() {
        let mut config = AppConfig::default();
        config.mode = RunMode::Live;
        assert!(config.validate().is_err());

        config.live.api_key = Some(String::new());
        assert!(config.validate().is_err());

        config.live.api_key = Some("k3y".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_mode_parsing() {
        assert_eq!("LIVE".parse::<RunMode>().unwrap(), RunMode::Live);
        assert_eq!("echo".parse::<RunMode>().unwrap(), RunMode::Loopback);
        assert!("tv".parse::<RunMode>().is_err());
        assert_eq!(RunMode::Live.to_string(), "live");
    }

    /// Defaults survive the serialize/deserialize trip through `config`.
    #[test]
    fn test_defaults_through_config_builder() {
        let config: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .set_override("bridge.sample_rate", 24000)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.bridge.sample_rate, 24000);
        assert_eq!(config.device.input_wav, None);
        assert_eq!(config.live.host, "generativelanguage.googleapis.com");
    }
}
