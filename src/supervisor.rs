//! # Task Supervisor
//!
//! Structured concurrency for a handful of cooperating tasks.
//!
//! ## Policy:
//! - Every task must finish for the group to succeed
//! - The first task to fail (error or panic) wins: the others are aborted
//!   and that single error is returned
//! - Dropping the group aborts whatever is still running

use crate::error::{BridgeError, BridgeResult};
use std::future::Future;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

/// A set of tasks joined with the first-failure-wins policy.
#[derive(Default)]
pub struct TaskGroup {
    name: &'static str,
    tasks: JoinSet<BridgeResult<()>>,
}

impl TaskGroup {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = BridgeResult<()>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task, or for the first failure.
    pub async fn join_all(mut self) -> BridgeResult<()> {
        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => task_error(e),
            };
            warn!(group = self.name, error = %failure, remaining = self.tasks.len(), "task failed, aborting group");
            self.tasks.shutdown().await;
            return Err(failure);
        }
        debug!(group = self.name, "all tasks finished");
        Ok(())
    }
}

fn task_error(e: JoinError) -> BridgeError {
    if e.is_panic() {
        let payload = e.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        BridgeError::Task(format!("task panicked: {}", message))
    } else {
        BridgeError::Task(e.to_string())
    }
}
