use std::time::Duration;

use tokio::time::Instant;

/// Liveness tracking for an open channel.
///
/// The actor drives the probe interval; the monitor only decides whether a
/// tick should send a probe and when silence turns into a failure.
#[derive(Debug, Clone)]
pub(crate) struct HeartbeatMonitor {
    timeout: Duration,
    running: bool,
    /// Deadline for the outstanding probe, if any
    deadline: Option<Instant>,
}

impl HeartbeatMonitor {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            running: false,
            deadline: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.running = true;
        self.deadline = None;
    }

    pub(crate) fn stop(&mut self) {
        self.running = false;
        self.deadline = None;
    }

    /// Returns `true` when a probe should be sent. At most one probe is
    /// outstanding at a time.
    pub(crate) fn on_tick(&mut self, now: Instant) -> bool {
        if !self.running || self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.timeout);
        true
    }

    /// Any inbound frame proves the channel is alive.
    pub(crate) fn observe(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline.filter(|_| self.running)
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }
}
