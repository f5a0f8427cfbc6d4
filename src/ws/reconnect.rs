//! Reconnection policy: a fixed backoff table plus an attempt budget.

use std::time::Duration;

use backoff::backoff::Backoff;

use super::config::ReconnectConfig;

/// Backoff that walks a fixed, non-decreasing table of delays and then
/// keeps returning the last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffTable {
    delays: Vec<Duration>,
    position: usize,
}

impl BackoffTable {
    #[must_use]
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays,
            position: 0,
        }
    }
}

impl Backoff for BackoffTable {
    fn reset(&mut self) {
        self.position = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self
            .delays
            .get(self.position)
            .or_else(|| self.delays.last())
            .copied();
        self.position = self.position.saturating_add(1).min(self.delays.len());
        delay
    }
}

/// What to do after an unexpected channel closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reconnect {
    /// Schedule the next attempt after the given delay
    After(Duration),
    /// Budget exhausted: stop reconnecting automatically
    Exhausted,
}

#[derive(Debug, Clone)]
pub(crate) struct ReconnectPolicy {
    backoff: BackoffTable,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl ReconnectPolicy {
    pub(crate) fn new(config: ReconnectConfig) -> Self {
        let max_attempts = config.max_attempts;
        Self {
            backoff: config.into(),
            max_attempts,
            attempt: 0,
        }
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Called on every unexpected close or failed handshake.
    pub(crate) fn on_failure(&mut self) -> Reconnect {
        if let Some(max) = self.max_attempts
            && self.attempt >= max
        {
            return Reconnect::Exhausted;
        }

        self.attempt = self.attempt.saturating_add(1);
        match self.backoff.next_backoff() {
            Some(delay) => Reconnect::After(delay),
            None => Reconnect::Exhausted,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
        self.backoff.reset();
    }
}
