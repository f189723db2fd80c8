//! # Fibonacci Backoff
//!
//! Requeue delays for failed reconciles. The sequence is kept in minutes
//! (1m, 1m, 2m, 3m, 5m, 8m, then 10m) and tracked per object so that one
//! failing cluster does not slow down the others.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Fibonacci backoff calculator
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_minutes: u64,
    prev_minutes: u64,
    current_minutes: u64,
    max_minutes: u64,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min_minutes` and capped at `max_minutes`
    #[must_use]
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            min_minutes,
            prev_minutes: 0,
            current_minutes: min_minutes,
            max_minutes,
        }
    }

    /// Return the current delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = Duration::from_secs(self.current_minutes * 60);
        let next_minutes = self.prev_minutes + self.current_minutes;
        self.prev_minutes = self.current_minutes;
        self.current_minutes = next_minutes.min(self.max_minutes);
        result
    }

    /// Restart the sequence
    pub fn reset(&mut self) {
        self.prev_minutes = 0;
        self.current_minutes = self.min_minutes;
    }
}

/// Per-object backoff state keyed by `kind/namespace/name`
#[derive(Debug, Default)]
pub struct BackoffRegistry {
    states: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl BackoffRegistry {
    /// Next delay for `key`, starting a new sequence on first failure
    pub fn next(&self, key: &str) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .entry(key.to_string())
            .or_insert_with(|| FibonacciBackoff::new(1, 10))
            .next_backoff()
    }

    /// Forget the failure history of `key` after a successful reconcile
    pub fn reset(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.remove(key);
    }
}
