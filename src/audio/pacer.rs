//! # Realtime Playback Pacer
//!
//! Slices a complete in-memory buffer into chunks whose arrival timing mimics
//! a live capture or playback device, without depending on any device.
//!
//! ## Algorithm:
//! 1. Record a monotonic start instant when the stream is first polled
//! 2. Sleep `expected_delta` (100ms by default)
//! 3. expected offset = floor(elapsed × sample_rate) × frame_size, capped at
//!    the buffer length
//! 4. If the offset moved past the cursor, yield `data[cursor..offset]`
//! 5. Stop once the cursor reaches the end of the buffer
//!
//! Offsets are always whole frames. Chunk sizes follow scheduler jitter and
//! are never guaranteed to be equal.

use crate::audio::buffer::Audio;
use crate::audio::format::AudioConfig;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Default sleep between two chunks.
pub const DEFAULT_EXPECTED_DELTA: Duration = Duration::from_millis(100);

/// Byte offset a realtime device would have reached after `elapsed`.
///
/// ## Example:
/// 250ms at 16kHz is 4000 frames, i.e. 8000 bytes.
pub fn expected_offset(elapsed: Duration, config: &AudioConfig) -> usize {
    let frames = elapsed.as_nanos() * config.sample_rate() as u128 / 1_000_000_000;
    frames as usize * config.frame_size()
}

/// Yield `audio` in chunks as if it was played in realtime.
///
/// The returned stream is finite and cannot be rewound; calling `pace` again
/// starts over from the beginning with a fresh start instant.
pub fn pace(audio: Audio, expected_delta: Duration) -> impl Stream<Item = Bytes> {
    let state = PacerState {
        audio,
        expected_delta,
        cursor: 0,
        started: None,
    };
    stream::unfold(state, |mut state| async move {
        let chunk = state.next_chunk().await?;
        Some((chunk, state))
    })
}

struct PacerState {
    audio: Audio,
    expected_delta: Duration,
    cursor: usize,
    started: Option<Instant>,
}

impl PacerState {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let total = self.audio.len();

        while self.cursor < total {
            tokio::time::sleep(self.expected_delta).await;
            let next = expected_offset(started.elapsed(), self.audio.config()).min(total);
            trace!(cursor = self.cursor, next, total, "pacer tick");
            if next > self.cursor {
                let chunk = self.audio.data().slice(self.cursor..next);
                self.cursor = next;
                return Some(chunk);
            }
        }
        None
    }
}
