//! Coalescing of rapid property updates.

use std::time::Duration;
use tokio::time::Instant;

/// Collects changed items and releases them once arrivals go quiet.
///
/// Each arrival pushes the deadline out by the full window, replacing the
/// previous deadline rather than adding a second one.
#[derive(Debug)]
pub struct Debouncer<T> {
    window: Duration,
    deadline: Option<Instant>,
    pending: Vec<T>,
}

impl<T: PartialEq> Debouncer<T> {
    /// Create a debouncer with the given quiet period.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            pending: Vec::new(),
        }
    }

    /// Record an arrival and restart the quiet period.
    pub fn push(&mut self, item: T, now: Instant) {
        if !self.pending.contains(&item) {
            self.pending.push(item);
        }
        self.deadline = Some(now + self.window);
    }

    /// When the pending items are due, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Release the pending items if the quiet period has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<Vec<T>> {
        match self.deadline {
            Some(deadline) if deadline <= now => Some(self.flush()),
            _ => None,
        }
    }

    /// Release the pending items immediately, bypassing the quiet period.
    pub fn flush(&mut self) -> Vec<T> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }
}
