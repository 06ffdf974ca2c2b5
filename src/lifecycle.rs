//! Idempotent, retryable bootstrap shared by every long-lived resource.
//!
//! States: `Idle` -> `Starting` -> `Ready(T)`. A failed start returns to
//! `Idle` so the next `open` retries. Concurrent `open` calls while a start
//! is in flight await that same attempt and all observe its outcome.
//! `Dead` is terminal: set when a resource fails in a way that must not be
//! papered over by a silent restart.
//!
//! A `reset` or `kill` that lands while a start is in flight leaves the
//! attempt orphaned. When it completes, its resource is handed to the
//! teardown hook and every waiter gets an error instead.

use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::{Result, TemitError};

type StartFuture<T> = Shared<BoxFuture<'static, Result<T>>>;

enum State<T: Clone> {
    Idle,
    Starting { attempt: u64, start: StartFuture<T> },
    Ready(T),
    Dead(TemitError),
}

struct Slot<T: Clone> {
    state: State<T>,
    attempts: u64,
}

/// Bootstrap state machine around a resource `T`.
pub(crate) struct Lifecycle<T: Clone> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Lifecycle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                state: State::Idle,
                attempts: 0,
            })),
        }
    }

    /// Return the ready resource, joining or launching a start as needed.
    ///
    /// `start` is only invoked when no attempt is in flight. `teardown`
    /// receives the resource of an attempt that was reset or killed before
    /// it finished; it runs once per orphaned attempt.
    pub async fn open<F, D>(&self, start: F, teardown: D) -> Result<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T>>,
        D: FnOnce(T) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let pending = {
            let mut slot = self.slot.lock();
            match &slot.state {
                State::Ready(resource) => return Ok(resource.clone()),
                State::Dead(error) => return Err(error.clone()),
                State::Starting { start, .. } => start.clone(),
                State::Idle => {
                    slot.attempts += 1;
                    let attempt = slot.attempts;
                    let pending =
                        settle_when_done(Arc::downgrade(&self.slot), attempt, start(), teardown);
                    slot.state = State::Starting {
                        attempt,
                        start: pending.clone(),
                    };
                    pending
                }
            }
        };

        pending.await
    }

    /// The resource, if ready.
    pub fn get(&self) -> Option<T> {
        match &self.slot.lock().state {
            State::Ready(resource) => Some(resource.clone()),
            _ => None,
        }
    }

    /// Forget the current resource so the next `open` starts afresh.
    ///
    /// Returns the resource that was ready, for the caller to tear down.
    /// A start in flight is orphaned. `Dead` stays dead.
    pub fn reset(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        if matches!(slot.state, State::Dead(_)) {
            return None;
        }
        match std::mem::replace(&mut slot.state, State::Idle) {
            State::Ready(resource) => Some(resource),
            _ => None,
        }
    }

    /// Move to the terminal failed state.
    pub fn kill(&self, error: TemitError) -> Option<T> {
        let previous = std::mem::replace(&mut self.slot.lock().state, State::Dead(error));
        match previous {
            State::Ready(resource) => Some(resource),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&self.slot.lock().state, State::Ready(_))
    }
}

impl<T> Default for Lifecycle<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a start so that the attempt records its own outcome exactly once,
/// however many callers are waiting on it.
fn settle_when_done<T, D>(
    slot: Weak<Mutex<Slot<T>>>,
    attempt: u64,
    start: BoxFuture<'static, Result<T>>,
    teardown: D,
) -> StartFuture<T>
where
    T: Clone + Send + Sync + 'static,
    D: FnOnce(T) -> BoxFuture<'static, ()> + Send + 'static,
{
    async move {
        let outcome = start.await;
        let orphaned = match slot.upgrade() {
            Some(slot) => record(&slot, attempt, &outcome),
            None => Some(TemitError::Closed),
        };
        match (outcome, orphaned) {
            (outcome, None) => outcome,
            (Ok(resource), Some(error)) => {
                teardown(resource).await;
                Err(error)
            }
            (Err(e), Some(_)) => Err(e),
        }
    }
    .boxed()
    .shared()
}

/// Move a still-current attempt on to `Ready` or back to `Idle`.
///
/// Returns the error to report when the attempt was reset or killed while
/// it ran.
fn record<T: Clone>(
    slot: &Mutex<Slot<T>>,
    attempt: u64,
    outcome: &Result<T>,
) -> Option<TemitError> {
    let mut slot = slot.lock();
    match &slot.state {
        State::Starting { attempt: current, .. } if *current == attempt => {
            slot.state = match outcome {
                Ok(resource) => State::Ready(resource.clone()),
                Err(_) => State::Idle,
            };
            None
        }
        State::Dead(error) => Some(error.clone()),
        _ => Some(TemitError::Closed),
    }
}
