//! # Emulated Audio Device
//!
//! A software microphone and speaker attached to the frontend side of the
//! relay. It behaves like the browser audio script: it reports `started`,
//! streams captured audio as `audio_in` chunks and plays `audio_out` chunks
//! at realtime rate, honouring `flush`.
//!
//! ## Key Components:
//! - **Microphone**: replays an input [`Audio`] through the pacer
//! - **Speaker**: a playback queue drained by wall-clock time into a recording
//!
//! ## Usage:
//! Loopback runs, integration tests, and anywhere a real browser is not
//! available.

use crate::audio::{pacer, Audio, AudioConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::relay::FrontendPort;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Reason reported when no input device is available.
pub const NO_INPUT_DEVICE: &str = "NotFoundError: Requested device not found";

/// Speaker statistics collected during a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackStats {
    pub chunks_queued: u64,
    pub bytes_queued: u64,
    pub bytes_played: u64,
    /// Bytes discarded by `flush` before they were played
    pub bytes_flushed: u64,
    pub flushes: u64,
}

/// Result of a device run.
#[derive(Debug, Clone)]
pub struct Recording {
    /// Everything the speaker actually played, in order
    pub audio: Audio,
    pub stats: PlaybackStats,
}

/// Emulated microphone + speaker for one audio session.
pub struct EmulatedDevice {
    port: FrontendPort,
    config: AudioConfig,
    input: Option<Audio>,
    require_input: bool,
    tick: Duration,
}

impl EmulatedDevice {
    /// Device speaking `config` on `port`, with no microphone input.
    pub fn new(port: FrontendPort, config: AudioConfig) -> Self {
        Self {
            port,
            config,
            input: None,
            require_input: false,
            tick: pacer::DEFAULT_EXPECTED_DELTA,
        }
    }

    /// Use `audio` as the microphone signal.
    ///
    /// # Panics
    /// If `audio` does not use the device's config.
    pub fn with_input(mut self, audio: Audio) -> Self {
        assert_eq!(
            audio.config(),
            &self.config,
            "input audio must match the device config"
        );
        self.input = Some(audio);
        self
    }

    /// Report `failed_to_start` when there is no microphone input.
    pub fn require_input(mut self, require: bool) -> Self {
        self.require_input = require;
        self
    }

    /// Pacer delta for the microphone and speaker clock.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run until the host tears the session down.
    ///
    /// ## Returns:
    /// - **Ok(Recording)**: the host finished the session
    /// - **Err(FailedToStart)**: input was required but missing
    pub async fn run(self) -> BridgeResult<Recording> {
        let Self {
            port,
            config,
            input,
            require_input,
            tick,
        } = self;

        if input.is_none() && require_input {
            warn!(reason = NO_INPUT_DEVICE, "emulated device failed to start");
            port.write(json!({ "failed_to_start": NO_INPUT_DEVICE }));
            // An `error` envelope in the same poll would shadow the report.
            port.finish_ok();
            return Err(BridgeError::FailedToStart(NO_INPUT_DEVICE.to_string()));
        }

        port.write(json!({ "started": true }));
        info!(config = %config, has_input = input.is_some(), "emulated device started");

        let microphone = input.map(|audio| tokio::spawn(capture(port.clone(), audio, tick)));
        let mut speaker = Speaker::new(config);

        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                request = port.read() => match request {
                    Some(request) => speaker.handle(request),
                    None => break,
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    speaker.advance(now - last_tick);
                    last_tick = now;
                }
            }
        }

        if let Some(microphone) = microphone {
            microphone.abort();
        }
        debug!(reason = ?port.abort_reason(), "emulated device stopped");
        Ok(speaker.finish())
    }
}

/// Replay `audio` as microphone chunks until it ends or the session aborts.
async fn capture(port: FrontendPort, audio: Audio, tick: Duration) {
    let total = audio.len();
    let mut chunks = std::pin::pin!(pacer::pace(audio, tick));
    let mut sent = 0usize;
    while let Some(chunk) = chunks.next().await {
        if port.is_aborted() {
            break;
        }
        sent += chunk.len();
        port.write(json!({ "audio_in": BASE64.encode(&chunk) }));
    }
    debug!(sent, total, "microphone input exhausted");
}

/// Playback queue drained by elapsed time.
struct Speaker {
    config: AudioConfig,
    queue: BytesMut,
    recording: BytesMut,
    /// Elapsed time not yet converted into whole frames, in nanos * sample rate
    owed: u128,
    stats: PlaybackStats,
}

impl Speaker {
    fn new(config: AudioConfig) -> Self {
        Self {
            config,
            queue: BytesMut::new(),
            recording: BytesMut::new(),
            owed: 0,
            stats: PlaybackStats::default(),
        }
    }

    fn handle(&mut self, request: Value) {
        if let Some(encoded) = request.get("audio_out") {
            match encoded.as_str().map(|s| BASE64.decode(s)) {
                Some(Ok(data)) => {
                    self.stats.chunks_queued += 1;
                    self.stats.bytes_queued += data.len() as u64;
                    self.queue.extend_from_slice(&data);
                }
                Some(Err(e)) => warn!(error = %e, "speaker dropped malformed audio_out"),
                None => warn!(value = %encoded, "audio_out is not a string"),
            }
        } else if request.get("flush").is_some() {
            self.stats.flushes += 1;
            self.stats.bytes_flushed += self.queue.len() as u64;
            debug!(discarded = self.queue.len(), "speaker flushed");
            self.queue.clear();
        } else {
            warn!(request = %request, "speaker ignoring unknown request");
        }
    }

    fn advance(&mut self, elapsed: Duration) {
        if self.queue.is_empty() {
            // Silence does not bank playback time.
            self.owed = 0;
            return;
        }
        self.owed += elapsed.as_nanos() * u128::from(self.config.sample_rate());
        let frames = self.owed / 1_000_000_000;
        self.owed %= 1_000_000_000;

        let frame_size = self.config.frame_size();
        let wanted = usize::try_from(frames)
            .unwrap_or(usize::MAX)
            .saturating_mul(frame_size);
        let available = self.queue.len() - self.queue.len() % frame_size;
        let played = self.queue.split_to(wanted.min(available));
        self.stats.bytes_played += played.len() as u64;
        self.recording.extend_from_slice(&played);
    }

    fn finish(self) -> Recording {
        let frame_size = self.config.frame_size();
        let mut recording = self.recording;
        recording.truncate(recording.len() - recording.len() % frame_size);
        info!(
            played = self.stats.bytes_played,
            flushed = self.stats.bytes_flushed,
            dropped = self.queue.len(),
            "emulated speaker finished"
        );
        Recording {
            audio: Audio::new(self.config, recording.freeze()),
            stats: self.stats,
        }
    }
}
