//! Global admission gate: bounded concurrency over the upstream plus a
//! bounded FIFO wait queue.
//!
//! At most `capacity` permits are out at once. When the gate is full, up to
//! `max_queue` callers wait in arrival order; beyond that, [`AdmissionGate::acquire`]
//! fails synchronously with [`GateError::QueueFull`] so a saturated process
//! answers immediately instead of building unbounded backlog.
//!
//! A freed slot is handed directly to the oldest waiter rather than being
//! returned to the pool, which preserves FIFO admission under contention.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors raised by the admission gate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    /// Capacity and the wait queue are both exhausted. Raised synchronously;
    /// the caller is never suspended on this path.
    #[error("admission queue full")]
    QueueFull,
    /// The gate was torn down while this caller waited. Not produced during
    /// normal operation because waiters keep the gate alive.
    #[error("admission gate closed")]
    Closed,
}

/// Read-only view of the gate for diagnostics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GateSnapshot {
    pub in_flight: usize,
    pub queued: usize,
    pub capacity: usize,
    pub max_queue: usize,
}

/// Bounded-concurrency limiter with a bounded FIFO wait queue.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    capacity: usize,
    max_queue: usize,
    state: Mutex<GateState>,
}

#[derive(Debug)]
struct GateState {
    in_flight: usize,
    waiters: VecDeque<oneshot::Sender<GatePermit>>,
}

impl AdmissionGate {
    /// Create a gate admitting up to `capacity` concurrent holders with room
    /// for `max_queue` waiters.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, max_queue: usize) -> Self {
        assert!(capacity > 0, "gate capacity must be at least 1");
        Self {
            inner: Arc::new(GateInner {
                capacity,
                max_queue,
                state: Mutex::new(GateState {
                    in_flight: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Acquire a slot, waiting in FIFO order behind earlier callers if the
    /// gate is full.
    ///
    /// The returned permit releases the slot when dropped, on every exit
    /// path.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::QueueFull`] synchronously when both capacity and
    /// the wait queue are exhausted at call time.
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            if state.in_flight < self.inner.capacity {
                state.in_flight += 1;
                return Ok(GatePermit::new(Arc::clone(&self.inner)));
            }
            if state.waiters.len() >= self.inner.max_queue {
                return Err(GateError::QueueFull);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        // Suspend until a releasing permit hands its slot over.
        rx.await.map_err(|_| GateError::Closed)
    }

    /// Current gate occupancy.
    #[must_use]
    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.inner.state.lock().unwrap();
        GateSnapshot {
            in_flight: state.in_flight,
            queued: state.waiters.len(),
            capacity: self.inner.capacity,
            max_queue: self.inner.max_queue,
        }
    }
}

impl GateInner {
    /// Return a slot: hand it to the oldest live waiter, or decrement the
    /// in-flight count when nobody is queued.
    fn release(inner: &Arc<Self>) {
        let mut state = inner.state.lock().unwrap();
        while let Some(tx) = state.waiters.pop_front() {
            match tx.send(GatePermit::new(Arc::clone(inner))) {
                // Slot handed over; in_flight is unchanged.
                Ok(()) => return,
                Err(mut unclaimed) => {
                    // The waiter vanished before admission. Defuse the permit
                    // so its drop does not release a second time, then offer
                    // the slot to the next waiter.
                    unclaimed.inner = None;
                }
            }
        }
        state.in_flight -= 1;
    }
}

/// An admitted slot. Dropping the permit releases the slot exactly once.
#[derive(Debug)]
#[must_use = "dropping the permit is what releases the admission slot"]
pub struct GatePermit {
    inner: Option<Arc<GateInner>>,
}

impl GatePermit {
    fn new(inner: Arc<GateInner>) -> Self {
        Self { inner: Some(inner) }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            GateInner::release(&inner);
        }
    }
}
