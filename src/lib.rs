//! # Live Audio Bridge
//!
//! Realtime audio between a host process and a frontend execution context
//! (a notebook's browser tab) that can only be reached by evaluating code in
//! it, plus the client side of a voice conversation with a remote live API.
//!
//! ## Architecture:
//! - **audio**: `AudioConfig`, `Audio` frame buffers, the realtime pacer and
//!   the audio session protocol
//! - **relay**: polling duplex message channel over a synchronous evaluate primitive
//! - **device**: emulated microphone and speaker on the frontend side
//! - **live**: upstream protocol, conversation loop, WebSocket client, worker thread
//! - **supervisor**: task group with first-failure-wins semantics
//! - **config** / **error**: configuration layering and the shared error type

pub mod audio; // PCM types, pacer, audio session
pub mod config; // Layered configuration
pub mod device; // Emulated microphone + speaker
pub mod error; // BridgeError / BridgeResult
pub mod live; // Upstream live API client side
pub mod relay; // Polling relay connection
pub mod supervisor; // Task groups

pub use error::{BridgeError, BridgeResult};
