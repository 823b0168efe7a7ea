//! In-flight limiting with a bounded, oldest-dropped wait queue.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use tern_types::{TernError, TernResult};
use tokio::sync::oneshot;

type Grant = oneshot::Sender<TernResult<()>>;

#[derive(Debug)]
struct SlotState {
    in_flight: usize,
    waiting: VecDeque<Grant>,
}

/// Admission control for requests on one client.
///
/// Up to `max_in_flight` requests run at once; further callers wait in FIFO
/// order. When `max_queued` callers are already waiting the oldest one is
/// rejected with [`TernError::QueueOverflow`] to make room.
#[derive(Debug)]
pub(crate) struct RequestSlots {
    max_in_flight: usize,
    max_queued: usize,
    state: Mutex<SlotState>,
}

/// A granted slot; dropping it admits the next waiter.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    slots: Arc<RequestSlots>,
}

impl RequestSlots {
    pub(crate) fn new(max_in_flight: usize, max_queued: usize) -> Arc<Self> {
        Arc::new(Self {
            max_in_flight: max_in_flight.max(1),
            max_queued,
            state: Mutex::new(SlotState { in_flight: 0, waiting: VecDeque::new() }),
        })
    }

    /// Wait for a slot.
    pub(crate) async fn acquire(self: &Arc<Self>) -> TernResult<SlotGuard> {
        let grant = {
            let mut state = self.state.lock();
            if state.in_flight < self.max_in_flight {
                state.in_flight += 1;
                return Ok(SlotGuard { slots: self.clone() });
            }
            if state.waiting.len() >= self.max_queued {
                if let Some(oldest) = state.waiting.pop_front() {
                    debug!(queued = self.max_queued, "request queue full, dropping oldest");
                    let _ = oldest.send(Err(TernError::QueueOverflow));
                }
            }
            if self.max_queued == 0 {
                return Err(TernError::QueueOverflow);
            }
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(tx);
            rx
        };

        match grant.await {
            Ok(Ok(())) => Ok(SlotGuard { slots: self.clone() }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TernError::NotConnected),
        }
    }

    /// Fail every waiting caller with `error`; running requests are untouched.
    pub(crate) fn reject_waiting(&self, error: &TernError) {
        let waiting: Vec<Grant> = self.state.lock().waiting.drain(..).collect();
        for grant in waiting {
            let _ = grant.send(Err(error.clone()));
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub(crate) fn queued(&self) -> usize {
        self.state.lock().waiting.len()
    }

    fn release(&self) {
        let mut state = self.state.lock();
        // Hand the slot straight to the next live waiter.
        while let Some(next) = state.waiting.pop_front() {
            if next.send(Ok(())).is_ok() {
                return;
            }
        }
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.release();
    }
}
