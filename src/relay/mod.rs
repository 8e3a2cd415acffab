//! # Relay Module
//!
//! Duplex message channel between the host process and a frontend execution
//! context that can only be reached through a synchronous evaluate primitive.
//!
//! ## Key Components:
//! - **Frontend seam**: the evaluate primitive as a trait, plus a JavaScript adapter
//! - **Relay connection**: queues, poll cycle, terminal states, pump guard
//! - **Emulated frontend**: the browser half implemented in-process

pub mod connection; // Queues, poll cycle and pump
pub mod emulated; // In-process frontend
pub mod frontend; // Evaluate primitive and envelopes

pub use connection::{RelayConnection, RunningRelay, DEFAULT_POLL_INTERVAL};
pub use emulated::{EmulatedFrontend, FrontendPort};
pub use frontend::{EvalJsFrontend, Frontend, ScriptHost};
