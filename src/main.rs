//! # Live Audio Bridge - Main Application Entry Point
//!
//! Command-line host for the bridge. Both modes run the browser side in
//! process (emulated frontend + emulated device), so no browser is needed.
//!
//! ## Modes:
//! - **loopback**: microphone audio (a WAV file) is echoed straight back to
//!   the speaker; the speaker recording is written as a WAV file
//! - **live**: the microphone is streamed to the remote live API on a worker
//!   thread; each spoken model turn is saved as a WAV file
//!
//! ## Configuration:
//! See `config.rs`: defaults, `config.toml`, `APP_*` environment variables,
//! `GOOGLE_API_KEY`.

use anyhow::{anyhow, Context, Result};
use live_audio_bridge::audio::{Audio, AudioConfig, AudioSession, LiveAudio};
use live_audio_bridge::config::{AppConfig, RunMode};
use live_audio_bridge::device::EmulatedDevice;
use live_audio_bridge::live::{self, ConversationEvent, ConversationSetup, ConversationWorker};
use live_audio_bridge::relay::EmulatedFrontend;
use live_audio_bridge::BridgeResult;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the main thread drains the worker's mailbox in live mode.
const UI_TICK: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-audio-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: mode={} stream={} poll={}ms",
        config.mode,
        config.audio_config()?,
        config.bridge.poll_interval_ms
    );

    let result = match config.mode {
        RunMode::Loopback => run_loopback(&config).await,
        RunMode::Live => run_live(&config).await,
    };

    if let Err(e) = &result {
        error!("Bridge stopped with an error: {:#}", e);
    } else {
        info!("Bridge stopped");
    }
    result
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g. "debug", "live_audio_bridge=trace")
/// - If not set, defaults to "live_audio_bridge=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_audio_bridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Echo the emulated microphone back to the emulated speaker.
///
/// ## Process:
/// 1. Start the emulated device and the audio session over an in-process relay
/// 2. Wait for the device to start
/// 3. Forward every captured chunk to playback until the input (plus a tail)
///    has played out, or until Ctrl+C
/// 4. Tear the session down and save what the speaker played
async fn run_loopback(config: &AppConfig) -> Result<()> {
    let audio_config = config.audio_config()?;
    let input = load_input(config, audio_config)?;
    let run_for = input.as_ref().map_or(Duration::ZERO, Audio::duration)
        + Duration::from_millis(config.device.tail_ms);

    let frontend = Arc::new(EmulatedFrontend::new());
    let device = emulated_device(config, &frontend, audio_config, input);
    let device_task = tokio::spawn(device.run());

    let audio = LiveAudio::start(frontend, audio_config, config.poll_interval())?;
    audio
        .await_start()
        .await
        .context("Emulated device failed to start")?;
    info!("Loopback running for {:.1}s", run_for.as_secs_f64());

    tokio::select! {
        result = tokio::time::timeout(run_for, echo(&audio)) => match result {
            Ok(Err(e)) => return Err(anyhow!(e).context("Loopback failed")),
            Ok(Ok(())) | Err(_) => info!("Loopback finished"),
        },
        _ = wait_for_shutdown() => info!("Shutdown signal received, stopping loopback..."),
    }

    let stats = audio.stats();
    audio.close();
    let recording = device_task.await??;
    info!(
        "Echoed {} chunks ({} bytes), speaker played {} bytes",
        stats.chunks_out, stats.bytes_out, recording.stats.bytes_played
    );

    write_wav(Path::new(&config.device.output_wav), &recording.audio)?;
    Ok(())
}

/// Play every captured chunk back until the session ends.
async fn echo(audio: &AudioSession) -> BridgeResult<()> {
    loop {
        let chunk = audio.read().await?;
        audio.enqueue(&chunk)?;
    }
}

/// Talk to the live API from a worker thread while this thread plays UI.
async fn run_live(config: &AppConfig) -> Result<()> {
    let audio_config = config.audio_config()?;
    let input = load_input(config, audio_config)?;
    let api_key = config
        .live
        .api_key
        .clone()
        .ok_or_else(|| anyhow!("Live mode needs an API key"))?;

    let job_config = config.clone();
    let mut worker = ConversationWorker::spawn("live-conversation", move |events| async move {
        let frontend = Arc::new(EmulatedFrontend::new());
        let device = emulated_device(&job_config, &frontend, audio_config, input);
        tokio::spawn(device.run());

        let audio = LiveAudio::start(frontend, audio_config, job_config.poll_interval())?;
        let (upstream_tx, upstream_rx) = live::connect(&job_config.live.host, &api_key).await?;
        info!("Connected to {}", job_config.live.host);

        let setup = ConversationSetup {
            model: job_config.live.model.clone(),
            initial_text: Some(job_config.live.initial_request_text.clone()),
        };
        live::run_conversation(audio.session().clone(), upstream_tx, upstream_rx, setup, events)
            .await
    })?;

    let turns_dir = PathBuf::from(&config.live.turns_dir);
    let mut turns = 0usize;
    let mut tick = tokio::time::interval(UI_TICK);
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                for event in worker.mailbox().drain() {
                    handle_event(event, &turns_dir, &mut turns)?;
                }
                if worker.is_finished() {
                    break;
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping conversation...");
                break;
            }
        }
    }

    for event in worker.mailbox().drain() {
        handle_event(event, &turns_dir, &mut turns)?;
    }
    tokio::task::spawn_blocking(move || worker.stop()).await??;
    info!("Saved {} turns to {}", turns, turns_dir.display());
    Ok(())
}

/// Render one conversation event. Runs on the main thread only.
fn handle_event(event: ConversationEvent, turns_dir: &Path, turns: &mut usize) -> Result<()> {
    match event {
        ConversationEvent::AudioStarted => info!("<connected>"),
        ConversationEvent::Interrupted => info!("<interrupted by the user>"),
        ConversationEvent::TurnComplete(audio) => {
            if !audio.is_empty() {
                *turns += 1;
                std::fs::create_dir_all(turns_dir)?;
                let name = format!(
                    "turn-{}-{:03}.wav",
                    chrono::Local::now().format("%Y%m%d-%H%M%S"),
                    turns
                );
                write_wav(&turns_dir.join(name), &audio)?;
            }
            info!("<end of turn>");
        }
        ConversationEvent::Unhandled(message) => warn!("unhandled message: {}", message),
    }
    Ok(())
}

fn emulated_device(
    config: &AppConfig,
    frontend: &EmulatedFrontend,
    audio_config: AudioConfig,
    input: Option<Audio>,
) -> EmulatedDevice {
    let device = EmulatedDevice::new(frontend.port(), audio_config)
        .require_input(config.device.require_input)
        .tick(config.expected_delta());
    match input {
        Some(input) => device.with_input(input),
        None => device,
    }
}

/// Read the configured input WAV, if any, and check it matches the stream.
fn load_input(config: &AppConfig, audio_config: AudioConfig) -> Result<Option<Audio>> {
    let Some(path) = &config.device.input_wav else {
        return Ok(None);
    };
    let bytes = std::fs::read(path).with_context(|| format!("Cannot read input WAV {}", path))?;
    let audio = Audio::from_wav_bytes(&bytes).with_context(|| format!("Cannot parse {}", path))?;
    if audio.config() != &audio_config {
        return Err(anyhow!(
            "Input WAV {} is {} but the stream is {}",
            path,
            audio.config(),
            audio_config
        ));
    }
    info!("Loaded {} ({:.1}s)", path, audio.duration().as_secs_f64());
    Ok(Some(audio))
}

fn write_wav(path: &Path, audio: &Audio) -> Result<()> {
    std::fs::write(path, audio.to_wav_bytes()?)
        .with_context(|| format!("Cannot write {}", path.display()))?;
    info!("Wrote {} ({:.1}s)", path.display(), audio.duration().as_secs_f64());
    Ok(())
}

/// Resolve on Ctrl+C (and SIGTERM on Unix).
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }
}
