//! # Conversation Worker
//!
//! Runs a conversation on a dedicated OS thread with its own single-threaded
//! tokio runtime, for hosts whose main thread belongs to a UI loop.
//!
//! ## Cross-thread hand-off:
//! The worker never touches UI state. It posts events into a [`UiMailbox`];
//! the UI thread calls [`UiMailbox::drain`] once per tick and renders what it
//! got.

use crate::error::{BridgeError, BridgeResult};
use std::future::Future;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Receiving end of the worker → UI channel.
pub struct UiMailbox<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> UiMailbox<T> {
    /// Create a mailbox and the sender workers post into.
    pub fn new() -> (mpsc::UnboundedSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Everything posted since the last drain, oldest first. Never blocks.
    pub fn drain(&mut self) -> Vec<T> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// A job running on its own thread and runtime.
pub struct ConversationWorker<T> {
    name: String,
    thread: Option<JoinHandle<BridgeResult<()>>>,
    shutdown: Option<oneshot::Sender<()>>,
    mailbox: UiMailbox<T>,
}

impl<T: Send + 'static> ConversationWorker<T> {
    /// Start `job` on a new thread named `name`.
    ///
    /// `job` receives the sender side of the worker's mailbox.
    pub fn spawn<F, Fut>(name: &str, job: F) -> BridgeResult<Self>
    where
        F: FnOnce(mpsc::UnboundedSender<T>) -> Fut + Send + 'static,
        Fut: Future<Output = BridgeResult<()>>,
    {
        let (events, mailbox) = UiMailbox::new();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let thread_name = name.to_string();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                let stop_name = thread_name.clone();
                let result = runtime.block_on(async move {
                    tokio::select! {
                        result = job(events) => result,
                        _ = shutdown_rx => {
                            debug!(worker = %stop_name, "worker asked to stop");
                            Ok(())
                        }
                    }
                });
                match &result {
                    Ok(()) => info!(worker = %thread_name, "worker finished"),
                    Err(e) => warn!(worker = %thread_name, error = %e, "worker failed"),
                }
                result
            })?;

        Ok(Self {
            name: name.to_string(),
            thread: Some(thread),
            shutdown: Some(shutdown),
            mailbox,
        })
    }

    pub fn mailbox(&mut self) -> &mut UiMailbox<T> {
        &mut self.mailbox
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Cancel the job and wait for the thread.
    ///
    /// Cancelling drops the job's future, which runs every guard it owns
    /// (the audio session, the upstream socket).
    pub fn stop(mut self) -> BridgeResult<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.wait()
    }

    /// Wait for the job to end on its own.
    pub fn join(mut self) -> BridgeResult<()> {
        self.wait()
    }

    fn wait(&mut self) -> BridgeResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread
            .join()
            .map_err(|_| BridgeError::Task(format!("worker thread {} panicked", self.name)))?
    }
}

impl<T> Drop for ConversationWorker<T> {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
