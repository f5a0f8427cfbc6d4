//! Channel lifecycle state machine.
//!
//! Every transition is a plain method that takes the current time where it
//! matters and returns the [`Action`]s the connection actor has to perform.
//! Nothing here touches sockets, timers or tasks.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::codec::{self, Frame, InboundEvent};
use super::config::Config;
use super::error::TransportError;
use super::heartbeat::HeartbeatMonitor;
use super::queue::{AckTracker, DeliveryResult, OutboundCommand, OutboundQueue};
use super::reconnect::{Reconnect, ReconnectPolicy};
use super::state::{ConnectionState, Status};

/// Close code for an intentional close; suppresses automatic reconnection.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code sent by the client when the heartbeat times out.
pub const HEARTBEAT_TIMEOUT_CLOSURE: u16 = 4000;

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    /// Acquire a session and start a handshake
    Open,
    /// Write a control frame on the open channel
    Transmit(String),
    /// Write the frame of the oldest command handed out for writing; the
    /// actor reports the result through `delivered` or `write_failed`
    Deliver(String),
    ArmAck(u64),
    CancelAck(u64),
    ClearAcks,
    StartHeartbeat,
    StopHeartbeat,
    /// Abort any handshake and close the socket with the given code
    Close(u16),
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartFallback,
    StopFallback,
}

/// What happened to a command handed to `send`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open channel
    Sent,
    /// Buffered until the channel opens
    Queued,
    /// Queue at capacity; the command was dropped
    Rejected,
}

#[derive(Debug)]
pub(crate) struct Machine {
    state: ConnectionState,
    reconnect: ReconnectPolicy,
    queue: OutboundQueue,
    pending: AckTracker,
    heartbeat: HeartbeatMonitor,
    /// Commands whose frames were handed to the actor but not yet written
    in_flight: VecDeque<OutboundCommand>,
    fallback_active: bool,
    /// Set by `disconnect`, cleared by `connect`
    stay_closed: bool,
    next_message_id: u64,
    last_frame_at: Option<Instant>,
}

impl Machine {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            state: ConnectionState::Idle,
            reconnect: ReconnectPolicy::new(config.reconnect.clone()),
            queue: OutboundQueue::new(config.queue_capacity),
            pending: AckTracker::default(),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_timeout),
            in_flight: VecDeque::new(),
            fallback_active: false,
            stay_closed: false,
            next_message_id: 0,
            last_frame_at: None,
        }
    }

    pub(crate) fn status(&self) -> Status {
        Status {
            state: self.state,
            connected: self.state.is_open(),
            connecting: self.state.is_connecting(),
            reconnect_attempt: self.reconnect.attempt(),
            fallback_active: self.fallback_active,
            queue_depth: self.queue.len(),
            oldest_queued_at: self.queue.oldest(),
            pending_acks: self.pending.len(),
            last_frame_at: self.last_frame_at,
        }
    }

    pub(crate) fn is_fallback_active(&self) -> bool {
        self.fallback_active
    }

    pub(crate) fn heartbeat_deadline(&self) -> Option<Instant> {
        self.heartbeat.deadline()
    }

    pub(crate) fn connect(&mut self) -> Vec<Action> {
        if self.state.is_open() || self.state.is_connecting() {
            return Vec::new();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(from = %self.state, "Connecting");

        self.stay_closed = false;
        self.reconnect.reset();
        self.state = ConnectionState::Connecting;
        vec![Action::CancelReconnect, Action::Open]
    }

    pub(crate) fn opened(&mut self, now: Instant) -> Vec<Action> {
        if !self.state.is_connecting() {
            // Only the pending handshake may become the open channel
            return vec![Action::Close(NORMAL_CLOSURE)];
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            attempts = self.reconnect.attempt(),
            queued = self.queue.len(),
            "Channel open"
        );

        self.state = ConnectionState::Open { since: now };
        self.reconnect.reset();
        self.heartbeat.start();

        let mut actions = vec![Action::StartHeartbeat];
        if self.fallback_active {
            self.fallback_active = false;
            actions.push(Action::StopFallback);
        }
        while let Some(command) = self.queue.pop() {
            self.transmit(command, &mut actions);
        }
        actions
    }

    /// Handshake failure, remote close or socket error. `code` is the close
    /// code received from the peer, if any.
    pub(crate) fn closed(&mut self, code: Option<u16>) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Open { .. } | ConnectionState::Closing => {
                self.heartbeat.stop();
                actions.push(Action::StopHeartbeat);
            }
            ConnectionState::Connecting => {}
            ConnectionState::Idle | ConnectionState::Closed => return actions,
        }
        self.state = ConnectionState::Closed;

        if self.stay_closed || code == Some(NORMAL_CLOSURE) {
            #[cfg(feature = "tracing")]
            tracing::debug!(?code, "Channel closed intentionally, not reconnecting");
            return actions;
        }

        match self.reconnect.on_failure() {
            Reconnect::After(delay) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    ?code,
                    attempt = self.reconnect.attempt(),
                    ?delay,
                    "Channel closed, scheduling reconnect"
                );
                actions.push(Action::ScheduleReconnect(delay));
            }
            Reconnect::Exhausted => {
                if !self.fallback_active {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        attempts = self.reconnect.attempt(),
                        "Reconnection budget exhausted, switching to polling"
                    );
                    self.fallback_active = true;
                    actions.push(Action::StartFallback);
                }
            }
        }
        actions
    }

    pub(crate) fn reconnect_due(&mut self) -> Vec<Action> {
        if self.stay_closed || !matches!(self.state, ConnectionState::Closed) {
            return Vec::new();
        }
        self.state = ConnectionState::Connecting;
        vec![Action::Open]
    }

    pub(crate) fn disconnect(&mut self) -> Vec<Action> {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            queued = self.queue.len(),
            pending = self.pending.len(),
            "Disconnecting, dropping outstanding commands"
        );

        self.stay_closed = true;
        self.queue.clear();
        self.in_flight.clear();
        self.pending.clear();
        self.heartbeat.stop();
        self.reconnect.reset();
        self.fallback_active = false;
        self.state = ConnectionState::Closed;

        vec![
            Action::CancelReconnect,
            Action::StopHeartbeat,
            Action::StopFallback,
            Action::ClearAcks,
            Action::Close(NORMAL_CLOSURE),
        ]
    }

    pub(crate) fn send(
        &mut self,
        payload: Map<String, Value>,
        requires_ack: bool,
    ) -> (
        SendOutcome,
        Option<oneshot::Receiver<DeliveryResult>>,
        Vec<Action>,
    ) {
        let (delivery, receiver) = if requires_ack {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let command = OutboundCommand::new(payload, requires_ack, delivery);

        if self.state.is_open() {
            let mut actions = Vec::new();
            self.transmit(command, &mut actions);
            return (SendOutcome::Sent, receiver, actions);
        }

        match self.queue.push(command) {
            Ok(()) => (SendOutcome::Queued, receiver, Vec::new()),
            Err(_rejected) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    queued = self.queue.len(),
                    oldest = ?self.queue.oldest(),
                    "Outbound queue full, rejecting command"
                );
                (SendOutcome::Rejected, None, Vec::new())
            }
        }
    }

    pub(crate) fn frame_received(
        &mut self,
        text: &str,
        now: Instant,
    ) -> (Vec<Action>, Option<InboundEvent>) {
        self.last_frame_at = Some(now);
        self.heartbeat.observe();

        match codec::decode(text) {
            Ok(None | Some(Frame::Pong)) => (Vec::new(), None),
            Ok(Some(Frame::Ping)) => (vec![Action::Transmit(codec::pong())], None),
            Ok(Some(Frame::Ack { message_id })) => (self.acknowledge(message_id), None),
            Ok(Some(Frame::Event(event))) => (Vec::new(), Some(event)),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "Dropping malformed frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                (Vec::new(), None)
            }
        }
    }

    pub(crate) fn ack_timed_out(&mut self, message_id: u64) -> Vec<Action> {
        let Some(mut command) = self.pending.take(message_id) else {
            return Vec::new();
        };

        if command.retried {
            #[cfg(feature = "tracing")]
            tracing::warn!(message_id, "Command not acknowledged after retry");
            command.resolve(Err(TransportError::DeliveryFailed { message_id }));
            return Vec::new();
        }

        command.retried = true;
        if self.state.is_open() {
            let mut actions = Vec::new();
            self.transmit(command, &mut actions);
            return actions;
        }

        if let Err(command) = self.queue.push(command) {
            command.resolve(Err(TransportError::DeliveryFailed { message_id }));
        }
        Vec::new()
    }

    pub(crate) fn heartbeat_tick(&mut self, now: Instant) -> Vec<Action> {
        if self.state.is_open() && self.heartbeat.on_tick(now) {
            vec![Action::Transmit(codec::ping())]
        } else {
            Vec::new()
        }
    }

    pub(crate) fn heartbeat_expired(&mut self, now: Instant) -> Vec<Action> {
        if !self.state.is_open() || !self.heartbeat.is_expired(now) {
            return Vec::new();
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(error = %TransportError::HeartbeatTimeout, "Forcing reconnect");

        self.state = ConnectionState::Closing;
        let mut actions = vec![Action::Close(HEARTBEAT_TIMEOUT_CLOSURE)];
        actions.extend(self.closed(None));
        actions
    }

    /// The oldest in-flight command was written. Ack-required commands start
    /// waiting for their `ack` only now.
    pub(crate) fn delivered(&mut self) -> Vec<Action> {
        let Some(command) = self.in_flight.pop_front() else {
            return Vec::new();
        };
        match (command.requires_ack, command.message_id) {
            (true, Some(message_id)) => {
                self.pending.track(message_id, command);
                vec![Action::ArmAck(message_id)]
            }
            _ => Vec::new(),
        }
    }

    /// A write failed and the socket is gone. Commands not yet written go
    /// back to the head of the queue, in order, for the next open channel.
    pub(crate) fn write_failed(&mut self) -> Vec<Action> {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            requeued = self.in_flight.len(),
            "Write failed, keeping unwritten commands for the next channel"
        );

        while let Some(command) = self.in_flight.pop_back() {
            self.queue.restore(command);
        }
        self.closed(None)
    }

    fn acknowledge(&mut self, message_id: u64) -> Vec<Action> {
        match self.pending.take(message_id) {
            Some(command) => {
                command.resolve(Ok(message_id));
                vec![Action::CancelAck(message_id)]
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(message_id, "Ignoring ack for unknown message");
                Vec::new()
            }
        }
    }

    fn transmit(&mut self, mut command: OutboundCommand, actions: &mut Vec<Action>) {
        if command.requires_ack && command.message_id.is_none() {
            self.next_message_id += 1;
            command.message_id = Some(self.next_message_id);
        }

        actions.push(Action::Deliver(codec::encode(
            &command.payload,
            command.message_id,
        )));
        self.in_flight.push_back(command);
    }
}
