//! Deadline tracking for the core dispatcher.
//!
//! Every timeout in this crate (command timeouts, signalling response timers,
//! disconnection timers) is an entry in a `DeadlineQueue`. The embedder drives
//! expiry explicitly: it asks the owning object for `next_timeout()` and calls
//! its `run_timers(now)` once that instant has passed. Cancellation is always
//! explicit, there is no background task.

use std::collections::BTreeMap;
use std::time::Instant;

pub(crate) type TimerId = u64;

/// A queue of deadlines, each carrying a token identifying what expired.
///
/// Identifiers are never reused so a stale `TimerId` held after cancellation
/// is harmless.
pub(crate) struct DeadlineQueue<T> {
    deadlines: BTreeMap<(Instant, TimerId), T>,
    index: BTreeMap<TimerId, Instant>,
    next_id: TimerId,
}

impl<T> DeadlineQueue<T> {
    pub fn new() -> Self {
        DeadlineQueue {
            deadlines: BTreeMap::new(),
            index: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Add a deadline, returning the id used to cancel it.
    pub fn add(&mut self, deadline: Instant, token: T) -> TimerId {
        let id = self.next_id;

        self.next_id += 1;

        self.deadlines.insert((deadline, id), token);
        self.index.insert(id, deadline);

        id
    }

    /// Cancel a deadline.
    ///
    /// Returns the token if the deadline was still armed.
    pub fn remove(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.index.remove(&id)?;

        self.deadlines.remove(&(deadline, id))
    }

    /// The earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(instant, _)| *instant)
    }

    /// Remove and return the earliest deadline that has passed.
    ///
    /// Call in a loop to drain everything due at `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, T)> {
        let (deadline, id) = *self.deadlines.keys().next()?;

        if deadline > now {
            return None;
        }

        self.index.remove(&id);

        self.deadlines.remove(&(deadline, id)).map(|token| (id, token))
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
