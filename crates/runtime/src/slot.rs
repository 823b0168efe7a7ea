//! Single-slot scheduled tasks.

use std::{future::Future, time::Duration};

use derive_more::Debug;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Holds at most one pending background task.
///
/// Scheduling a new task aborts the one already in the slot, which gives
/// debounce semantics: only the last trigger within the delay runs. Dropping
/// the slot aborts whatever is pending.
#[derive(Debug, Default)]
pub struct TaskSlot {
    #[debug(skip)]
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    /// Create an empty slot.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: Mutex::new(None) }
    }

    /// Run `fut` after `delay`, replacing (and aborting) any pending task.
    pub fn schedule<F>(&self, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            fut.await;
        });
        if let Some(previous) = self.handle.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Run `fut` now, replacing (and aborting) any pending task.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(Duration::ZERO, fut);
    }

    /// Abort the pending task, if any.
    pub fn cancel(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    /// Whether a task is scheduled or still running.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
