//! # Relay Connection
//!
//! An ordered, reliable, duplex JSON message channel between the host and a
//! frontend that cannot push data by itself. Delivery happens by polling: a
//! background pump calls [`RelayConnection::poll`] at a fixed interval, which
//! drains the outbound queue into one [`Frontend::poll`] round-trip and
//! ingests whatever the frontend returns.
//!
//! ## Lifecycle:
//! 1. **Open**: messages flow both ways
//! 2. **Finished**: the frontend reported `finished`; remaining inbound
//!    messages are still readable, then `read` yields end of stream
//! 3. **Failed**: the frontend reported `error`, or the evaluate primitive
//!    failed; every `read` returns that error
//!
//! Both terminal states are final: writes are rejected and later envelopes
//! are dropped.
//!
//! ## Limitations:
//! Neither queue is bounded. Latency is bounded below by the poll interval.

use crate::error::{BridgeError, BridgeResult};
use crate::relay::frontend::{Frontend, Inbound, Outbound};
use serde_json::Value;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Default interval between two poll cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why a failed relay failed.
#[derive(Debug, Clone, PartialEq)]
enum Failure {
    /// The frontend sent `{"error": ...}`.
    Remote(String),
    /// The evaluate primitive itself failed.
    Frontend(String),
}

impl Failure {
    fn to_error(&self) -> BridgeError {
        match self {
            Failure::Remote(msg) => BridgeError::Remote(msg.clone()),
            Failure::Frontend(msg) => BridgeError::Frontend(msg.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Completion {
    Finished,
    Failed(Failure),
}

#[derive(Default)]
struct Queues {
    /// Envelopes waiting for the next poll.
    outbound: Vec<Value>,
    /// Payloads received but not read yet.
    inbound: VecDeque<Value>,
    completion: Option<Completion>,
}

struct Shared {
    id: Uuid,
    frontend: Arc<dyn Frontend>,
    queues: Mutex<Queues>,
    notify: Notify,
}

/// Handle to a relay connection.
///
/// ## Rust Concepts:
/// - **Clone**: every clone refers to the same queues (`Arc<Shared>`), so the
///   pump task, the reader and the writers can each own a handle
/// - **Mutex + Notify**: the queues are locked only for short, synchronous
///   sections; waiting readers park on `Notify` instead of holding the lock
///
/// Reading is meant for one logical consumer at a time.
#[derive(Clone)]
pub struct RelayConnection {
    shared: Arc<Shared>,
}

impl RelayConnection {
    /// Create a connection over `frontend` without starting a pump.
    ///
    /// Most callers want [`RunningRelay::start`]; this constructor is for
    /// hosts that drive [`poll`](Self::poll) themselves.
    pub fn new(frontend: Arc<dyn Frontend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                frontend,
                queues: Mutex::new(Queues::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.shared
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `message` for delivery on the next poll cycle.
    ///
    /// Never blocks. Fails with `BridgeError::Closed` (or the relay's
    /// failure) once the connection is terminal.
    pub fn write(&self, message: Value) -> BridgeResult<()> {
        let envelope = serde_json::to_value(Outbound::Data(message))?;
        let mut queues = self.queues();
        match &queues.completion {
            Some(Completion::Failed(failure)) => Err(failure.to_error()),
            Some(Completion::Finished) => Err(BridgeError::Closed),
            None => {
                queues.outbound.push(envelope);
                Ok(())
            }
        }
    }

    /// Next inbound message, in arrival order.
    ///
    /// ## Returns:
    /// - **Ok(Some(message))**: the next message
    /// - **Ok(None)**: the frontend finished normally and nothing is left
    /// - **Err(error)**: the relay failed; returned to every reader, every call
    pub async fn read(&self) -> BridgeResult<Option<Value>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a poll between the check and the
            // await cannot be missed.
            notified.as_mut().enable();

            {
                let mut queues = self.queues();
                if let Some(Completion::Failed(failure)) = &queues.completion {
                    return Err(failure.to_error());
                }
                if let Some(message) = queues.inbound.pop_front() {
                    return Ok(Some(message));
                }
                if queues.completion.is_some() {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    /// Run one poll cycle.
    ///
    /// ## Process:
    /// 1. Atomically take the whole outbound queue
    /// 2. Hand it to the frontend in a single evaluate round-trip
    /// 3. Ingest `data`, `error` and `finished` envelopes, waking readers
    ///
    /// A failing round-trip fails the relay and is returned to the caller.
    pub fn poll(&self) -> BridgeResult<()> {
        let batch = {
            let mut queues = self.queues();
            if queues.completion.is_some() {
                return Ok(());
            }
            std::mem::take(&mut queues.outbound)
        };

        match self.shared.frontend.poll(&batch) {
            Ok(received) => {
                self.ingest(received);
                Ok(())
            }
            Err(e) => {
                let message = match &e {
                    BridgeError::Frontend(msg) => msg.clone(),
                    other => other.to_string(),
                };
                error!(relay_id = %self.id(), error = %message, "frontend poll failed");
                self.complete(Completion::Failed(Failure::Frontend(message)));
                Err(e)
            }
        }
    }

    fn ingest(&self, received: Vec<Value>) {
        if received.is_empty() {
            return;
        }
        {
            let mut queues = self.queues();
            for raw in received {
                if queues.completion.is_some() {
                    debug!(relay_id = %self.id(), envelope = %raw, "dropping envelope after termination");
                    continue;
                }
                match Inbound::classify(&raw) {
                    Some(Inbound::Data(payload)) => queues.inbound.push_back(payload),
                    Some(Inbound::Error(message)) => {
                        warn!(relay_id = %self.id(), error = %message, "frontend reported an error");
                        queues.completion = Some(Completion::Failed(Failure::Remote(message)));
                    }
                    Some(Inbound::Finished(_)) => {
                        info!(relay_id = %self.id(), "frontend finished");
                        queues.completion = Some(Completion::Finished);
                    }
                    None => {
                        warn!(relay_id = %self.id(), envelope = %raw, "ignoring unknown relay envelope");
                    }
                }
            }
        }
        self.shared.notify.notify_waiters();
    }

    /// Move to a terminal state unless already there.
    fn complete(&self, completion: Completion) {
        {
            let mut queues = self.queues();
            if queues.completion.is_none() {
                queues.completion = Some(completion);
            }
        }
        self.shared.notify.notify_waiters();
    }

    pub fn is_terminated(&self) -> bool {
        self.queues().completion.is_some()
    }

    /// Envelopes waiting for the next poll.
    pub fn pending_outbound(&self) -> usize {
        self.queues().outbound.len()
    }

    /// Messages received but not read yet.
    pub fn pending_inbound(&self) -> usize {
        self.queues().inbound.len()
    }
}

/// Poll until the relay reaches a terminal state.
async fn pump(connection: RelayConnection, interval: Duration) -> BridgeResult<()> {
    while !connection.is_terminated() {
        connection.poll()?;
        tokio::time::sleep(interval).await;
    }
    debug!("relay pump stopped");
    Ok(())
}

/// A relay connection with its pump running.
///
/// ## Resource Management:
/// Dropping the guard (normal return, `?`, panic unwinding, or cancellation
/// of the owning task) aborts the pump and sends the frontend a best-effort
/// `finish`. The frontend's acknowledgement is never awaited and a lost
/// `finish` is only logged.
pub struct RunningRelay {
    connection: RelayConnection,
    pump: Option<JoinHandle<()>>,
}

impl RunningRelay {
    /// Launch `user_code` in the frontend and start polling it.
    ///
    /// # Panics
    /// Outside a tokio runtime, since the pump is spawned as a task.
    pub fn start(
        frontend: Arc<dyn Frontend>,
        user_code: &str,
        poll_interval: Duration,
    ) -> BridgeResult<Self> {
        frontend.start(user_code)?;

        let connection = RelayConnection::new(frontend);
        let span = info_span!("relay_pump", relay_id = %connection.id());
        let pump_connection = connection.clone();
        let pump = tokio::spawn(
            async move {
                if let Err(e) = pump(pump_connection, poll_interval).await {
                    error!(error = %e, "relay pump failed");
                }
            }
            .instrument(span),
        );

        info!(
            relay_id = %connection.id(),
            poll_interval_ms = poll_interval.as_millis() as u64,
            "relay started"
        );
        Ok(Self {
            connection,
            pump: Some(pump),
        })
    }

    pub fn connection(&self) -> &RelayConnection {
        &self.connection
    }

    /// Tear the relay down now instead of at drop time.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(pump) = self.pump.take() else {
            return;
        };
        pump.abort();
        if let Err(e) = self.connection.shared.frontend.finish() {
            warn!(relay_id = %self.connection.id(), error = %e, "failed to send finish to frontend");
        }
        // Nothing polls any more; wake readers with end of stream.
        self.connection.complete(Completion::Finished);
        debug!(relay_id = %self.connection.id(), "relay torn down");
    }
}

impl Deref for RunningRelay {
    type Target = RelayConnection;

    fn deref(&self) -> &RelayConnection {
        &self.connection
    }
}

impl Drop for RunningRelay {
    fn drop(&mut self) {
        self.teardown();
    }
}
