//! # Conversation Loop
//!
//! Wires an [`AudioSession`] to an upstream live API connection: microphone
//! chunks go up as realtime input, model speech comes down and is queued for
//! playback.
//!
//! ## Task Layout:
//! - **start watcher**: fails the conversation if the audio device cannot start
//! - **microphone → upstream**: `read` → `realtimeInput`
//! - **upstream → speaker**: decode → `enqueue` / `clear_queue`, turn bookkeeping
//!
//! The three run in one [`TaskGroup`]; the first failure ends the
//! conversation. The upstream closing its stream is a normal end.

use crate::audio::{Audio, AudioSession};
use crate::error::{BridgeError, BridgeResult};
use crate::live::protocol::{self, ServerEvent};
use crate::supervisor::TaskGroup;
use bytes::BytesMut;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Session parameters sent before any audio.
#[derive(Debug, Clone)]
pub struct ConversationSetup {
    pub model: String,
    /// Text turn sent right after setup, if any
    pub initial_text: Option<String>,
}

/// Progress reported to whoever drives the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// The frontend audio device is live.
    AudioStarted,
    /// The user interrupted the model; playback was flushed.
    Interrupted,
    /// The model finished a turn. Carries everything it said during the
    /// turn (possibly empty) for later replay.
    TurnComplete(Audio),
    /// A server message the loop does not act on.
    Unhandled(Value),
}

/// Run one conversation until the upstream closes or something fails.
///
/// ## Parameters:
/// - `upstream_tx`: JSON messages for the live API
/// - `upstream_rx`: JSON messages from the live API; end of stream ends the
///   conversation normally
/// - `events`: progress for the UI; a dropped receiver is ignored
pub async fn run_conversation<S>(
    audio: Arc<AudioSession>,
    upstream_tx: mpsc::UnboundedSender<Value>,
    upstream_rx: S,
    setup: ConversationSetup,
    events: mpsc::UnboundedSender<ConversationEvent>,
) -> BridgeResult<()>
where
    S: Stream<Item = BridgeResult<Value>> + Send + Unpin + 'static,
{
    send(&upstream_tx, protocol::setup_message(&setup.model).to_json()?)?;
    if let Some(text) = setup.initial_text.as_deref().filter(|t| !t.is_empty()) {
        send(&upstream_tx, protocol::encode_text_input(text).to_json()?)?;
    }
    info!(session_id = %audio.id(), model = %setup.model, "conversation started");

    let mut group = TaskGroup::new("conversation");
    group.spawn(watch_start(audio.clone(), events.clone()));
    group.spawn(forward_microphone(audio.clone(), upstream_tx));
    group.spawn(play_upstream(audio.clone(), upstream_rx, events));

    match group.join_all().await {
        Err(BridgeError::UpstreamClosed) => {
            info!(session_id = %audio.id(), "upstream closed, conversation over");
            Ok(())
        }
        other => other,
    }
}

fn send(upstream_tx: &mpsc::UnboundedSender<Value>, message: Value) -> BridgeResult<()> {
    upstream_tx
        .send(message)
        .map_err(|_| BridgeError::UpstreamClosed)
}

async fn watch_start(
    audio: Arc<AudioSession>,
    events: mpsc::UnboundedSender<ConversationEvent>,
) -> BridgeResult<()> {
    audio.await_start().await?;
    let _ = events.send(ConversationEvent::AudioStarted);
    Ok(())
}

async fn forward_microphone(
    audio: Arc<AudioSession>,
    upstream_tx: mpsc::UnboundedSender<Value>,
) -> BridgeResult<()> {
    let mut chunks = 0u64;
    loop {
        let data = audio.read().await?;
        send(
            &upstream_tx,
            protocol::encode_audio_input(&data, audio.config()).to_json()?,
        )?;
        chunks += 1;
        if chunks % 50 == 0 {
            debug!(chunks, "microphone chunks forwarded");
        }
    }
}

async fn play_upstream<S>(
    audio: Arc<AudioSession>,
    mut upstream_rx: S,
    events: mpsc::UnboundedSender<ConversationEvent>,
) -> BridgeResult<()>
where
    S: Stream<Item = BridgeResult<Value>> + Unpin,
{
    let mut turn = BytesMut::new();

    while let Some(message) = upstream_rx.next().await {
        let message = message?;
        let event = match protocol::decode_server_message(&message) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "skipping undecodable server message");
                continue;
            }
        };

        match event {
            ServerEvent::Audio(data) => {
                audio.enqueue(&data)?;
                turn.extend_from_slice(&data);
            }
            ServerEvent::Interrupted => {
                info!("interrupted by the user");
                audio.clear_queue()?;
                let _ = events.send(ConversationEvent::Interrupted);
            }
            ServerEvent::TurnComplete => {
                let spoken = turn.split().freeze();
                let recording = Audio::try_new(*audio.config(), spoken).unwrap_or_else(|e| {
                    warn!(error = %e, "turn audio is not frame aligned, dropping it");
                    Audio::empty(*audio.config())
                });
                info!(duration_ms = recording.duration().as_millis() as u64, "end of turn");
                let _ = events.send(ConversationEvent::TurnComplete(recording));
            }
            ServerEvent::SetupComplete => debug!("upstream setup complete"),
            ServerEvent::Empty => {}
            ServerEvent::Unhandled(message) => {
                warn!(message = %message, "unhandled server message");
                let _ = events.send(ConversationEvent::Unhandled(message));
            }
        }
    }

    Err(BridgeError::UpstreamClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioConfig, LiveAudio};
    use crate::device::EmulatedDevice;
    use crate::relay::{EmulatedFrontend, DEFAULT_POLL_INTERVAL};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::json;
    use std::time::Duration;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    struct Harness {
        audio: LiveAudio,
        device: tokio::task::JoinHandle<BridgeResult<crate::device::Recording>>,
        sent: mpsc::UnboundedReceiver<Value>,
        server: mpsc::UnboundedSender<BridgeResult<Value>>,
        events: mpsc::UnboundedReceiver<ConversationEvent>,
        conversation: tokio::task::JoinHandle<BridgeResult<()>>,
    }

    fn harness(input: Option<Audio>) -> Harness {
        let config = AudioConfig::new(24000);
        let frontend = Arc::new(EmulatedFrontend::new());
        let mut device = EmulatedDevice::new(frontend.port(), config);
        if let Some(input) = input {
            device = device.with_input(input);
        }
        let device = tokio::spawn(device.run());
        let audio = LiveAudio::start(frontend, config, DEFAULT_POLL_INTERVAL).unwrap();

        let (up_tx, sent) = mpsc::unbounded_channel();
        let (server, server_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let setup = ConversationSetup {
            model: "models/test".to_string(),
            initial_text: Some("Hello".to_string()),
        };
        let conversation = tokio::spawn(run_conversation(
            audio.session().clone(),
            up_tx,
            UnboundedReceiverStream::new(server_rx),
            setup,
            events_tx,
        ));

        Harness {
            audio,
            device,
            sent,
            server,
            events,
            conversation,
        }
    }

    fn speech(data: &[u8]) -> Value {
        json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": BASE64.encode(data)}}
        ]}}})
    }

    #[tokio::test(start_paused = true)]
    async fn test_microphone_goes_upstream() {
        let config = AudioConfig::new(24000);
        let input = Audio::from_samples(config, &vec![7i16; 2400]);
        let mut h = harness(Some(input.clone()));

        assert_eq!(h.sent.recv().await.unwrap(), json!({"setup": {"model": "models/test"}}));
        assert_eq!(
            h.sent.recv().await.unwrap()["clientContent"]["turns"][0]["parts"][0]["text"],
            "Hello"
        );
        assert_eq!(h.events.recv().await.unwrap(), ConversationEvent::AudioStarted);

        let mut uploaded = Vec::new();
        while uploaded.len() < input.len() {
            let message = h.sent.recv().await.unwrap();
            let chunk = &message["realtimeInput"]["mediaChunks"][0];
            assert_eq!(chunk["mimeType"], "audio/pcm;rate=24000");
            uploaded.extend(BASE64.decode(chunk["data"].as_str().unwrap()).unwrap());
        }
        assert_eq!(&uploaded[..], &input.data()[..]);

        drop(h.server);
        h.conversation.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_turn_is_played_and_reported() {
        let mut h = harness(None);
        assert_eq!(h.events.recv().await.unwrap(), ConversationEvent::AudioStarted);

        let first = vec![1u8, 0, 2, 0];
        let second = vec![3u8, 0];
        h.server.send(Ok(speech(&first))).unwrap();
        h.server.send(Ok(json!({"serverContent": {}}))).unwrap();
        h.server.send(Ok(speech(&second))).unwrap();
        h.server.send(Ok(json!({"serverContent": {"turnComplete": true}}))).unwrap();

        match h.events.recv().await.unwrap() {
            ConversationEvent::TurnComplete(turn) => assert_eq!(turn.samples(), vec![1, 2, 3]),
            other => panic!("expected turn completion, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(h.server);
        h.conversation.await.unwrap().unwrap();
        h.audio.close();

        let recording = h.device.await.unwrap().unwrap();
        assert_eq!(recording.audio.samples(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruption_flushes_playback() {
        let mut h = harness(None);
        assert_eq!(h.events.recv().await.unwrap(), ConversationEvent::AudioStarted);

        h.server.send(Ok(speech(&vec![0u8; 96000]))).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.server.send(Ok(json!({"serverContent": {"interrupted": true}}))).unwrap();
        assert_eq!(h.events.recv().await.unwrap(), ConversationEvent::Interrupted);

        tokio::time::sleep(Duration::from_millis(300)).await;
        h.server.send(Ok(json!({"serverContent": {"turnComplete": true}}))).unwrap();
        assert!(matches!(
            h.events.recv().await.unwrap(),
            ConversationEvent::TurnComplete(_)
        ));

        drop(h.server);
        h.conversation.await.unwrap().unwrap();
        h.audio.close();

        let recording = h.device.await.unwrap().unwrap();
        assert_eq!(recording.stats.flushes, 1);
        assert!(recording.audio.len() < 96000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_error_ends_conversation() {
        let h = harness(None);
        h.server
            .send(Err(BridgeError::upstream("connection reset")))
            .unwrap();
        match h.conversation.await.unwrap() {
            Err(BridgeError::Upstream(msg)) => assert_eq!(msg, "connection reset"),
            other => panic!("expected upstream error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_audio_session_ends_conversation() {
        let h = harness(None);
        h.audio.close();
        assert!(matches!(
            h.conversation.await.unwrap(),
            Err(BridgeError::Closed)
        ));
        drop(h.server);
    }
}
