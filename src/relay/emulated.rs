//! # Emulated Frontend
//!
//! An in-process stand-in for the browser half of the relay. It keeps the
//! same queues and abort semantics as the bundled `start_session.js`
//! runtime, but the "user code" is ordinary Rust driving a [`FrontendPort`].
//!
//! Used by the emulated audio device, by tests, and by any host that wants
//! to exercise the bridge without a browser.

use crate::error::BridgeResult;
use crate::relay::frontend::Frontend;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct PortState {
    /// Host payloads not yet read by the frontend code.
    recv: VecDeque<Value>,
    /// Envelopes waiting for the host's next poll.
    send: Vec<Value>,
    /// Set once the session is over, with the reason.
    aborted: Option<String>,
    user_code: Option<String>,
}

#[derive(Default)]
struct PortShared {
    state: Mutex<PortState>,
    notify: Notify,
}

impl PortShared {
    fn state(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort(state: &mut PortState, reason: &str) {
        if state.aborted.is_none() {
            state.aborted = Some(reason.to_string());
        }
    }
}

/// Frontend that lives in the host process.
///
/// ## Usage:
/// ```rust
/// use std::sync::Arc;
/// use live_audio_bridge::relay::EmulatedFrontend;
///
/// let frontend = Arc::new(EmulatedFrontend::new());
/// let port = frontend.port(); // the "browser side"
/// port.write(serde_json::json!({"started": true}));
/// ```
#[derive(Default)]
pub struct EmulatedFrontend {
    shared: Arc<PortShared>,
}

impl EmulatedFrontend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The frontend-side `connection` object.
    pub fn port(&self) -> FrontendPort {
        FrontendPort {
            shared: self.shared.clone(),
        }
    }

    /// Code passed to [`Frontend::start`], if any.
    pub fn user_code(&self) -> Option<String> {
        self.shared.state().user_code.clone()
    }
}

impl Frontend for EmulatedFrontend {
    fn start(&self, user_code: &str) -> BridgeResult<()> {
        debug!(bytes = user_code.len(), "emulated frontend received user code");
        self.shared.state().user_code = Some(user_code.to_string());
        Ok(())
    }

    fn poll(&self, outbound: &[Value]) -> BridgeResult<Vec<Value>> {
        let sent = {
            let mut state = self.shared.state();
            for message in outbound {
                if let Some(data) = message.get("data") {
                    state.recv.push_back(data.clone());
                }
                if let Some(error) = message.get("error") {
                    PortShared::abort(&mut state, &format!("Remote: {}", error));
                }
                if message.get("finish").is_some() {
                    PortShared::abort(&mut state, "Remote: finished");
                }
            }
            std::mem::take(&mut state.send)
        };
        self.shared.notify.notify_waiters();
        Ok(sent)
    }

    fn finish(&self) -> BridgeResult<()> {
        self.poll(&[json!({"finish": true})]).map(|_| ())
    }
}

/// Frontend-side end of the relay, mirroring the browser `connection` object.
#[derive(Clone)]
pub struct FrontendPort {
    shared: Arc<PortShared>,
}

impl FrontendPort {
    /// Queue `data` for the host. Delivered on the host's next poll.
    pub fn write(&self, data: Value) {
        self.shared.state().send.push(json!({"data": data}));
    }

    /// Next payload from the host; `None` once the session is aborted.
    pub async fn read(&self) -> Option<Value> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state();
                if state.aborted.is_some() {
                    return None;
                }
                if let Some(data) = state.recv.pop_front() {
                    return Some(data);
                }
            }

            notified.await;
        }
    }

    /// Frontend code returned normally.
    pub fn finish_ok(&self) {
        {
            let mut state = self.shared.state();
            PortShared::abort(&mut state, "end of input");
            state.send.push(json!({"finished": true}));
        }
        self.shared.notify.notify_waiters();
    }

    /// Frontend code failed with `error`.
    pub fn fail(&self, error: impl Display) {
        {
            let mut state = self.shared.state();
            let message = error.to_string();
            PortShared::abort(&mut state, &message);
            state.send.push(json!({"error": message}));
        }
        self.shared.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.state().aborted.is_some()
    }

    /// Why the session ended, once it has.
    pub fn abort_reason(&self) -> Option<String> {
        self.shared.state().aborted.clone()
    }

    /// Wait until the session is aborted.
    pub async fn aborted(&self) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_exchanges_queues() {
        let frontend = EmulatedFrontend::new();
        let port = frontend.port();
        port.write(json!({"started": true}));

        let sent = frontend.poll(&[json!({"data": {"audio_out": "AAA="}})]).unwrap();
        assert_eq!(sent, vec![json!({"data": {"started": true}})]);
        assert_eq!(port.read().await, Some(json!({"audio_out": "AAA="})));

        assert!(frontend.poll(&[]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_aborts_reader() {
        let frontend = EmulatedFrontend::new();
        let port = frontend.port();

        let reader = tokio::spawn({
            let port = port.clone();
            async move { port.read().await }
        });
        tokio::task::yield_now().await;

        frontend.finish().unwrap();
        assert_eq!(reader.await.unwrap(), None);
        assert_eq!(port.abort_reason().as_deref(), Some("Remote: finished"));
        port.aborted().await;
    }

    #[test]
    fn test_completion_envelopes() {
        let frontend = EmulatedFrontend::new();
        let port = frontend.port();
        port.fail("NotAllowedError: Permission denied");

        let sent = frontend.poll(&[]).unwrap();
        assert_eq!(sent, vec![json!({"error": "NotAllowedError: Permission denied"})]);
        assert!(port.is_aborted());

        let other = EmulatedFrontend::new();
        other.port().finish_ok();
        assert_eq!(other.poll(&[]).unwrap(), vec![json!({"finished": true})]);
    }
}
