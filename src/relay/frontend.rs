//! # Frontend Seam
//!
//! The frontend is an isolated execution context (a notebook's browser tab)
//! that cannot push data to the host on its own. The host reaches it only
//! through one synchronous primitive: evaluate a script there and collect the
//! return value. [`Frontend`] models that primitive in the three shapes the
//! relay needs; [`EvalJsFrontend`] renders them into scripts for a real
//! [`ScriptHost`].
//!
//! ## Envelopes:
//! - **Host → Frontend**: `{"data": payload}`, `{"finish": true}`
//! - **Frontend → Host**: `{"data": payload}`, `{"error": "..."}`, `{"finished": true}`

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Browser-side session runtime installed before user code runs.
pub const START_SESSION_JS: &str = include_str!("js/start_session.js");

/// Envelope sent from the host to the frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outbound {
    /// Payload for the frontend's `connection.read()`.
    Data(Value),
    /// Out-of-band teardown instruction.
    Finish(bool),
}

/// Envelope sent from the frontend to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inbound {
    /// Payload written by the frontend's `connection.write()`.
    Data(Value),
    /// Frontend code failed; the relay is over.
    Error(String),
    /// Frontend code returned; the relay is over.
    Finished(bool),
}

impl Inbound {
    /// Classify a raw envelope.
    ///
    /// Returns `None` for shapes this version does not know about so callers
    /// can log and skip them.
    pub fn classify(raw: &Value) -> Option<Inbound> {
        let object = raw.as_object()?;
        if let Some(data) = object.get("data") {
            return Some(Inbound::Data(data.clone()));
        }
        if let Some(error) = object.get("error") {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Some(Inbound::Error(message));
        }
        if object.contains_key("finished") {
            return Some(Inbound::Finished(true));
        }
        None
    }
}

/// The host's view of a frontend execution context.
///
/// ## Rust Concepts:
/// - **Send + Sync**: the pump task and the teardown path both hold an
///   `Arc<dyn Frontend>`, possibly on different worker threads
/// - **Synchronous methods**: the underlying evaluate primitive blocks until
///   the frontend returns, so the trait does too
pub trait Frontend: Send + Sync {
    /// Install the session runtime and launch `user_code` (fire-and-forget).
    fn start(&self, user_code: &str) -> BridgeResult<()>;

    /// Deliver `outbound` envelopes and collect whatever the frontend queued
    /// since the previous poll.
    ///
    /// Called inline from the relay pump, so it must return promptly: a
    /// slow evaluate stalls every task sharing the pump's runtime thread.
    fn poll(&self, outbound: &[Value]) -> BridgeResult<Vec<Value>>;

    /// Tell the frontend to release its resources. Never awaited.
    fn finish(&self) -> BridgeResult<()>;
}

/// A host able to evaluate JavaScript in the frontend.
pub trait ScriptHost: Send + Sync {
    /// Evaluate `script` and return its JSON result.
    fn eval(&self, script: &str) -> BridgeResult<Value>;

    /// Evaluate `script`, ignoring its result.
    fn eval_detached(&self, script: &str) -> BridgeResult<()>;
}

/// [`Frontend`] implementation for hosts that evaluate JavaScript.
///
/// ## Script shapes:
/// - start: user code wrapped in `async (connection) => {...}` plus
///   [`START_SESSION_JS`]
/// - poll: `window._js_session_on_poll([...])`
/// - finish: `window._js_session_on_poll([{"finish": true}])`
pub struct EvalJsFrontend<H> {
    host: H,
}

impl<H: ScriptHost> EvalJsFrontend<H> {
    pub fn new(host: H) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Script that boots the session runtime around `user_code`.
    pub fn start_script(user_code: &str) -> String {
        format!(
            "let userFn = async (connection) => {{\n{}\n}};\n{}\nstart_session(userFn);\n1;",
            user_code, START_SESSION_JS
        )
    }

    /// Script delivering `outbound` and returning the frontend's queue.
    pub fn poll_script(outbound: &[Value]) -> BridgeResult<String> {
        Ok(format!(
            "window._js_session_on_poll({})",
            serde_json::to_string(outbound)?
        ))
    }
}

impl<H: ScriptHost> Frontend for EvalJsFrontend<H> {
    fn start(&self, user_code: &str) -> BridgeResult<()> {
        self.host.eval_detached(&Self::start_script(user_code))
    }

    fn poll(&self, outbound: &[Value]) -> BridgeResult<Vec<Value>> {
        let script = Self::poll_script(outbound)?;
        match self.host.eval(&script)? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(BridgeError::frontend(format!(
                "poll returned a non-array value: {}",
                other
            ))),
        }
    }

    fn finish(&self) -> BridgeResult<()> {
        let finish = serde_json::to_value(Outbound::Finish(true))?;
        self.host.eval_detached(&Self::poll_script(&[finish])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHost {
        scripts: Mutex<Vec<String>>,
        reply: Mutex<Value>,
    }

    impl ScriptHost for RecordingHost {
        fn eval(&self, script: &str) -> BridgeResult<Value> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(self.reply.lock().unwrap().clone())
        }

        fn eval_detached(&self, script: &str) -> BridgeResult<()> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_envelope_shapes() {
        assert_eq!(
            serde_json::to_value(Outbound::Data(json!({"audio_out": "AAA="}))).unwrap(),
            json!({"data": {"audio_out": "AAA="}})
        );
        assert_eq!(
            serde_json::to_value(Outbound::Finish(true)).unwrap(),
            json!({"finish": true})
        );
    }

    #[test]
    fn test_classify_inbound() {
        assert_eq!(
            Inbound::classify(&json!({"data": {"started": true}})),
            Some(Inbound::Data(json!({"started": true})))
        );
        assert_eq!(
            Inbound::classify(&json!({"error": "Error: boom"})),
            Some(Inbound::Error("Error: boom".to_string()))
        );
        assert_eq!(
            Inbound::classify(&json!({"finished": true})),
            Some(Inbound::Finished(true))
        );
        assert_eq!(Inbound::classify(&json!({"heartbeat": 1})), None);
        assert_eq!(Inbound::classify(&json!("data")), None);
    }

    #[test]
    fn test_eval_js_scripts() {
        let host = RecordingHost::default();
        *host.reply.lock().unwrap() = json!([{"data": 1}]);
        let frontend = EvalJsFrontend::new(host);

        frontend.start("await connection.read();").unwrap();
        let received = frontend.poll(&[json!({"data": "hi"})]).unwrap();
        frontend.finish().unwrap();

        assert_eq!(received, vec![json!({"data": 1})]);
        let scripts = frontend.host().scripts.lock().unwrap();
        assert!(scripts[0].contains("await connection.read();"));
        assert!(scripts[0].contains("start_session(userFn)"));
        assert_eq!(scripts[1], r#"window._js_session_on_poll([{"data":"hi"}])"#);
        assert_eq!(scripts[2], r#"window._js_session_on_poll([{"finish":true}])"#);
    }

    #[test]
    fn test_poll_rejects_non_array() {
        let host = RecordingHost::default();
        *host.reply.lock().unwrap() = json!({"oops": true});
        let frontend = EvalJsFrontend::new(host);
        assert!(matches!(frontend.poll(&[]), Err(BridgeError::Frontend(_))));
    }
}
