//! # Live Conversation Module
//!
//! Client side of a realtime voice conversation with the remote live API.
//!
//! ## Key Components:
//! - **Protocol**: JSON encoders and the server message classifier
//! - **Conversation**: the loop between an audio session and the upstream
//! - **Client**: WebSocket transport
//! - **Worker**: dedicated-thread runner with a UI mailbox

pub mod client; // WebSocket transport
pub mod conversation; // Audio session <-> upstream loop
pub mod protocol; // Wire messages
pub mod worker; // Dedicated thread + UI mailbox

pub use client::{connect, endpoint_url, UpstreamStream, DEFAULT_HOST};
pub use conversation::{run_conversation, ConversationEvent, ConversationSetup};
pub use protocol::ServerEvent;
pub use worker::{ConversationWorker, UiMailbox};
