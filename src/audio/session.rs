//! # Audio Session
//!
//! Turns a generic relay connection into an audio protocol: PCM chunks
//! captured by the frontend's recording device flow in, PCM chunks for the
//! frontend's playback device flow out, both base64-encoded.
//!
//! ## Session Lifecycle:
//! 1. **Pending**: relay running, waiting for the frontend device
//! 2. **Started**: the frontend reported `started`; audio flows
//! 3. **Failed to start**: the frontend reported `failed_to_start` (for
//!    example the user denied microphone access)
//! 4. **Closed**: the relay ended or the owning [`LiveAudio`] was dropped
//!
//! ## Messages:
//! - **Host → Frontend**: `{"audio_out": base64}`, `{"flush": true}`
//! - **Frontend → Host**: `{"audio_in": base64}`, `{"started": true}`,
//!   `{"failed_to_start": reason}`

use crate::audio::format::{AudioConfig, SampleFormat};
use crate::error::{BridgeError, BridgeResult};
use crate::relay::{Frontend, RelayConnection, RunningRelay};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Browser script that opens the microphone and speaker.
pub const AUDIO_SESSION_JS: &str = include_str!("js/audio_session.js");

/// AudioWorklet processor used by [`AUDIO_SESSION_JS`].
pub const PORT_PROCESSOR_JS: &str = include_str!("js/port_processor.js");

/// Commands sent to the frontend's playback device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackCommand {
    /// Base64 PCM chunk to queue for playback.
    AudioOut(String),
    /// Drop all queued, unplayed audio.
    Flush(bool),
}

/// Where the one-shot start signal stands.
#[derive(Debug, Clone, PartialEq)]
enum StartState {
    Pending,
    Started,
    FailedToStart(String),
    RelayFailed { remote: bool, message: String },
    RelayClosed,
}

impl StartState {
    fn from_relay_error(err: &BridgeError) -> Self {
        match err {
            BridgeError::Closed => StartState::RelayClosed,
            BridgeError::Frontend(message) => StartState::RelayFailed {
                remote: false,
                message: message.clone(),
            },
            BridgeError::Remote(message) => StartState::RelayFailed {
                remote: true,
                message: message.clone(),
            },
            other => StartState::RelayFailed {
                remote: true,
                message: other.to_string(),
            },
        }
    }

    fn outcome(&self) -> Option<BridgeResult<()>> {
        match self {
            StartState::Pending => None,
            StartState::Started => Some(Ok(())),
            StartState::FailedToStart(reason) => Some(Err(BridgeError::FailedToStart(reason.clone()))),
            StartState::RelayFailed { remote: true, message } => Some(Err(BridgeError::Remote(message.clone()))),
            StartState::RelayFailed { remote: false, message } => Some(Err(BridgeError::Frontend(message.clone()))),
            StartState::RelayClosed => Some(Err(BridgeError::Closed)),
        }
    }
}

/// Traffic counters for one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    /// Captured chunks decoded and queued for `read`
    pub chunks_in: u64,
    pub bytes_in: u64,
    /// Chunks sent for playback
    pub chunks_out: u64,
    pub bytes_out: u64,
    pub flushes: u64,
    /// `audio_in` payloads that were not valid base64
    pub malformed_chunks: u64,
}

type ChunkResult = BridgeResult<Bytes>;

/// Connection to audio recording/playback on the frontend side.
///
/// ## Thread Safety:
/// Shared as `Arc<AudioSession>` between the receive loop and any number of
/// callers. Reading captured audio is single-consumer: concurrent `read`
/// calls queue up on an async mutex.
pub struct AudioSession {
    id: Uuid,
    config: AudioConfig,
    connection: RelayConnection,
    /// Taken by the receive loop when it ends, which closes the channel.
    chunks_tx: Mutex<Option<mpsc::UnboundedSender<ChunkResult>>>,
    chunks_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChunkResult>>,
    start: watch::Sender<StartState>,
    stats: Mutex<SessionStats>,
}

impl AudioSession {
    /// Wrap an already running relay connection.
    ///
    /// The session does nothing until [`receive_loop`](Self::receive_loop)
    /// runs; [`LiveAudio::start`] wires both up.
    pub fn new(config: AudioConfig, connection: RelayConnection) -> Self {
        let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
        let (start, _) = watch::channel(StartState::Pending);
        Self {
            id: Uuid::new_v4(),
            config,
            connection,
            chunks_tx: Mutex::new(Some(chunks_tx)),
            chunks_rx: tokio::sync::Mutex::new(chunks_rx),
            start,
            stats: Mutex::new(SessionStats::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        self.stats_mut().clone()
    }

    fn stats_mut(&self) -> MutexGuard<'_, SessionStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until the frontend device is active.
    ///
    /// ## Returns:
    /// - **Ok(())**: the frontend sent `started`
    /// - **Err(FailedToStart)**: the frontend sent `failed_to_start`, with its reason
    /// - **Err(Remote/Frontend/Closed)**: the relay ended before either signal
    ///
    /// Can be awaited repeatedly and from several tasks; all see the same outcome.
    pub async fn await_start(&self) -> BridgeResult<()> {
        let mut rx = self.start.subscribe();
        let state = match rx.wait_for(|state| *state != StartState::Pending).await {
            Ok(state) => state.clone(),
            Err(_) => StartState::RelayClosed,
        };
        state.outcome().unwrap_or(Err(BridgeError::Closed))
    }

    /// Next captured PCM chunk, already base64-decoded.
    ///
    /// After the relay ends this returns the relay's error once (if it
    /// failed), then `BridgeError::Closed`.
    pub async fn read(&self) -> BridgeResult<Bytes> {
        let mut rx = self.chunks_rx.lock().await;
        rx.recv().await.unwrap_or(Err(BridgeError::Closed))
    }

    /// Send a raw PCM chunk to the frontend for playback.
    ///
    /// The frontend buffers and paces the actual output.
    pub fn enqueue(&self, audio_data: &[u8]) -> BridgeResult<()> {
        let encoded = BASE64.encode(audio_data);
        self.connection
            .write(serde_json::to_value(PlaybackCommand::AudioOut(encoded))?)?;
        let mut stats = self.stats_mut();
        stats.chunks_out += 1;
        stats.bytes_out += audio_data.len() as u64;
        Ok(())
    }

    /// Discard audio queued for playback but not yet played.
    ///
    /// ## Usage:
    /// Interruption: a new user utterance stops the bot mid-sentence.
    pub fn clear_queue(&self) -> BridgeResult<()> {
        self.connection
            .write(serde_json::to_value(PlaybackCommand::Flush(true))?)?;
        self.stats_mut().flushes += 1;
        Ok(())
    }

    /// Demultiplex relay messages until the relay ends.
    ///
    /// This loop is the only reader of the relay connection.
    pub async fn receive_loop(self: Arc<Self>) {
        loop {
            match self.connection.read().await {
                Ok(Some(message)) => self.handle_message(message),
                Ok(None) => {
                    info!(session_id = %self.id, "relay finished");
                    self.shut_down(BridgeError::Closed);
                    return;
                }
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "relay failed");
                    self.shut_down(e);
                    return;
                }
            }
        }
    }

    fn handle_message(&self, message: Value) {
        let fields = match message {
            Value::Object(fields) => fields,
            other => {
                warn!(session_id = %self.id, message = %other, "ignoring non-object message");
                return;
            }
        };

        if let Some(encoded) = fields.get("audio_in") {
            self.push_chunk(encoded);
        }
        if fields.contains_key("started") {
            self.resolve_start(StartState::Started);
        }
        if let Some(reason) = fields.get("failed_to_start") {
            let reason = match reason {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.resolve_start(StartState::FailedToStart(reason));
        }
        for key in fields.keys() {
            if !matches!(key.as_str(), "audio_in" | "started" | "failed_to_start") {
                warn!(session_id = %self.id, key = %key, "ignoring unknown message field");
            }
        }
    }

    fn push_chunk(&self, encoded: &Value) {
        let decoded = encoded
            .as_str()
            .ok_or_else(|| BridgeError::InvalidAudio("audio_in is not a string".to_string()))
            .and_then(|s| BASE64.decode(s).map_err(BridgeError::from));

        match decoded {
            Ok(raw) => {
                {
                    let mut stats = self.stats_mut();
                    stats.chunks_in += 1;
                    stats.bytes_in += raw.len() as u64;
                }
                let sender = self.chunks_tx.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(tx) = sender.as_ref() {
                    let _ = tx.send(Ok(Bytes::from(raw)));
                }
            }
            Err(e) => {
                self.stats_mut().malformed_chunks += 1;
                warn!(session_id = %self.id, error = %e, "dropping malformed audio_in chunk");
            }
        }
    }

    /// First signal wins; later ones are logged and dropped.
    fn resolve_start(&self, next: StartState) {
        let mut previous = None;
        let changed = self.start.send_if_modified(|state| {
            if *state == StartState::Pending {
                *state = next.clone();
                true
            } else {
                previous = Some(state.clone());
                false
            }
        });
        if changed {
            match &next {
                StartState::Started => info!(session_id = %self.id, "audio device started"),
                StartState::FailedToStart(reason) => {
                    warn!(session_id = %self.id, reason = %reason, "audio device failed to start")
                }
                other => debug!(session_id = %self.id, state = ?other, "start signal resolved by relay end"),
            }
        } else {
            debug!(
                session_id = %self.id,
                ignored = ?next,
                current = ?previous,
                "start signal already resolved"
            );
        }
    }

    /// Resolve a pending start with `reason` and close the chunk channel.
    fn shut_down(&self, reason: BridgeError) {
        self.resolve_start(StartState::from_relay_error(&reason));
        let sender = self
            .chunks_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            if !reason.is_closed() {
                let _ = tx.send(Err(reason));
            }
        }
    }
}

/// Script run as the relay's user code for an audio session.
pub fn audio_user_code(config: &AudioConfig) -> BridgeResult<String> {
    Ok(format!(
        "const audio_worklet_js = {};\nconst sample_rate = {};\n{}",
        serde_json::to_string(PORT_PROCESSOR_JS)?,
        config.sample_rate(),
        AUDIO_SESSION_JS
    ))
}

/// A running audio session: relay, pump and receive loop.
///
/// ## Resource Management:
/// Dropping (or [`close`](Self::close)) cancels the receive loop, tears the
/// relay down (which tells the frontend to release the microphone and audio
/// context) and wakes anyone still waiting on the session.
pub struct LiveAudio {
    session: Arc<AudioSession>,
    receive_task: Option<JoinHandle<()>>,
    relay: Option<RunningRelay>,
}

impl LiveAudio {
    /// Open a live audio bridge to `frontend`.
    ///
    /// # Panics
    /// If `config` is not mono `S16_LE`, or outside a tokio runtime.
    pub fn start(
        frontend: Arc<dyn Frontend>,
        config: AudioConfig,
        poll_interval: Duration,
    ) -> BridgeResult<Self> {
        assert_eq!(config.channels(), 1, "audio sessions are mono");
        assert_eq!(config.format(), SampleFormat::S16Le, "audio sessions are S16_LE");

        let relay = RunningRelay::start(frontend, &audio_user_code(&config)?, poll_interval)?;
        let session = Arc::new(AudioSession::new(config, relay.connection().clone()));
        let span = info_span!("audio_session", session_id = %session.id(), relay_id = %relay.id());
        let receive_task = tokio::spawn(session.clone().receive_loop().instrument(span));

        info!(session_id = %session.id(), config = %config, "live audio started");
        Ok(Self {
            session,
            receive_task: Some(receive_task),
            relay: Some(relay),
        })
    }

    /// Shared handle for tasks that outlive a borrow of this guard.
    pub fn session(&self) -> &Arc<AudioSession> {
        &self.session
    }

    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
        if let Some(relay) = self.relay.take() {
            relay.close();
        }
        self.session.shut_down(BridgeError::Closed);
    }
}

impl Deref for LiveAudio {
    type Target = AudioSession;

    fn deref(&self) -> &AudioSession {
        &self.session
    }
}

impl Drop for LiveAudio {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{EmulatedFrontend, FrontendPort, DEFAULT_POLL_INTERVAL};
    use serde_json::json;

    fn live(config: AudioConfig) -> (LiveAudio, FrontendPort, Arc<EmulatedFrontend>) {
        let frontend = Arc::new(EmulatedFrontend::new());
        let port = frontend.port();
        let audio = LiveAudio::start(frontend.clone(), config, DEFAULT_POLL_INTERVAL).unwrap();
        (audio, port, frontend)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_poll_with_audio_and_started() {
        let (audio, port, _) = live(AudioConfig::new(16000));
        port.write(json!({"audio_in": "AAA="}));
        port.write(json!({"started": true}));

        audio.await_start().await.unwrap();
        let chunk = audio.read().await.unwrap();
        assert_eq!(&chunk[..], &BASE64.decode("AAA=").unwrap()[..]);
        assert_eq!(&chunk[..], &[0u8, 0u8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_to_start_carries_reason() {
        let (audio, port, _) = live(AudioConfig::new(16000));
        port.write(json!({"failed_to_start": "NotAllowedError: Permission denied"}));

        match audio.await_start().await {
            Err(BridgeError::FailedToStart(reason)) => {
                assert_eq!(reason, "NotAllowedError: Permission denied")
            }
            other => panic!("expected FailedToStart, got {:?}", other),
        }

        // A late `started` must not crash the session or flip the outcome
        port.write(json!({"started": true}));
        port.write(json!({"audio_in": "AQA="}));
        assert_eq!(&audio.read().await.unwrap()[..], &[1u8, 0u8]);
        assert!(matches!(audio.await_start().await, Err(BridgeError::FailedToStart(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_wins_over_late_failure() {
        let (audio, port, _) = live(AudioConfig::new(24000));
        port.write(json!({"started": true}));
        audio.await_start().await.unwrap();

        port.write(json!({"failed_to_start": {"name": "NotReadableError"}}));
        port.write(json!({"audio_in": "AAA="}));
        audio.read().await.unwrap();
        audio.await_start().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_arrive_in_order() {
        let (audio, port, _) = live(AudioConfig::new(16000));
        let chunks: Vec<Vec<u8>> = vec![vec![1, 2], vec![3, 4, 5, 6], vec![7, 8]];
        port.write(json!({"started": true}));
        for chunk in &chunks[..2] {
            port.write(json!({"audio_in": BASE64.encode(chunk)}));
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        port.write(json!({"audio_in": BASE64.encode(&chunks[2])}));

        for expected in &chunks {
            assert_eq!(&audio.read().await.unwrap()[..], &expected[..]);
        }
        let stats = audio.stats();
        assert_eq!(stats.chunks_in, 3);
        assert_eq!(stats.bytes_in, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_and_clear_reach_frontend() {
        let (audio, port, _) = live(AudioConfig::new(16000));
        audio.enqueue(&[0x10, 0x00, 0x20, 0x00]).unwrap();
        audio.clear_queue().unwrap();

        assert_eq!(
            port.read().await,
            Some(json!({"audio_out": BASE64.encode([0x10u8, 0x00, 0x20, 0x00])}))
        );
        assert_eq!(port.read().await, Some(json!({"flush": true})));

        let stats = audio.stats();
        assert_eq!((stats.chunks_out, stats.bytes_out, stats.flushes), (1, 4, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_error_rejects_pending_start() {
        let (audio, port, _) = live(AudioConfig::new(16000));
        port.fail("TypeError: audioCtx is undefined");

        match audio.await_start().await {
            Err(BridgeError::Remote(msg)) => assert_eq!(msg, "TypeError: audioCtx is undefined"),
            other => panic!("expected remote error, got {:?}", other),
        }
        assert!(matches!(audio.read().await, Err(BridgeError::Remote(_))));
        assert!(matches!(audio.read().await, Err(BridgeError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_finish_closes_session() {
        let (audio, port, _) = live(AudioConfig::new(16000));
        port.write(json!({"audio_in": "AAA="}));
        port.finish_ok();

        assert!(matches!(audio.await_start().await, Err(BridgeError::Closed)));
        assert_eq!(audio.read().await.unwrap().len(), 2);
        assert!(matches!(audio.read().await, Err(BridgeError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_and_unknown_messages_are_not_fatal() {
        let (audio, port, _) = live(AudioConfig::new(16000));
        port.write(json!({"audio_in": "!!not base64!!"}));
        port.write(json!({"volume": 0.5}));
        port.write(json!("just a string"));
        port.write(json!({"audio_in": "AAA=", "started": true}));

        audio.await_start().await.unwrap();
        assert_eq!(audio.read().await.unwrap().len(), 2);
        assert_eq!(audio.stats().malformed_chunks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_frontend() {
        let (audio, port, frontend) = live(AudioConfig::new(48000));
        let code = frontend.user_code().unwrap();
        assert!(code.contains("const sample_rate = 48000;"));
        assert!(code.contains("registerProcessor"));

        let session = audio.session().clone();
        drop(audio);

        assert!(port.is_aborted());
        assert!(matches!(session.read().await, Err(BridgeError::Closed)));
        assert!(matches!(session.await_start().await, Err(BridgeError::Closed)));
        assert!(session.enqueue(&[0, 0]).is_err());
    }
}
