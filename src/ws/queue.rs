use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use super::error::TransportError;

/// Resolution of an acknowledgment-required command: the message id it was
/// acknowledged under, or why it was not.
pub(crate) type DeliveryResult = std::result::Result<u64, TransportError>;

/// A command waiting to be transmitted or acknowledged.
#[derive(Debug)]
pub(crate) struct OutboundCommand {
    /// Assigned on first transmission of an ack-required command, kept on retry
    pub(crate) message_id: Option<u64>,
    pub(crate) payload: Map<String, Value>,
    pub(crate) requires_ack: bool,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) retried: bool,
    delivery: Option<oneshot::Sender<DeliveryResult>>,
}

impl OutboundCommand {
    pub(crate) fn new(
        payload: Map<String, Value>,
        requires_ack: bool,
        delivery: Option<oneshot::Sender<DeliveryResult>>,
    ) -> Self {
        Self {
            message_id: None,
            payload,
            requires_ack,
            enqueued_at: Utc::now(),
            retried: false,
            delivery,
        }
    }

    /// Notify the sender, if it is still listening.
    pub(crate) fn resolve(mut self, result: DeliveryResult) {
        if let Some(delivery) = self.delivery.take() {
            _ = delivery.send(result);
        }
    }
}

/// Bounded FIFO of commands submitted while the channel is not open.
///
/// Overflow policy is drop-newest: a full queue hands the command back.
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    commands: VecDeque<OutboundCommand>,
    capacity: usize,
}

impl OutboundQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            commands: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, command: OutboundCommand) -> Result<(), OutboundCommand> {
        if self.commands.len() >= self.capacity {
            return Err(command);
        }
        self.commands.push_back(command);
        Ok(())
    }

    /// Put back a command that was taken for writing but never written.
    /// Restored commands are never rejected.
    pub(crate) fn restore(&mut self, command: OutboundCommand) {
        self.commands.push_front(command);
    }

    pub(crate) fn pop(&mut self) -> Option<OutboundCommand> {
        self.commands.pop_front()
    }

    /// When the command at the head of the queue was first submitted.
    pub(crate) fn oldest(&self) -> Option<DateTime<Utc>> {
        self.commands.front().map(|command| command.enqueued_at)
    }

    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    pub(crate) fn clear(&mut self) {
        self.commands.clear();
    }
}

/// Commands transmitted and awaiting an `ack`, keyed by message id.
#[derive(Debug, Default)]
pub(crate) struct AckTracker {
    pending: HashMap<u64, OutboundCommand>,
}

impl AckTracker {
    pub(crate) fn track(&mut self, message_id: u64, command: OutboundCommand) {
        self.pending.insert(message_id, command);
    }

    pub(crate) fn take(&mut self, message_id: u64) -> Option<OutboundCommand> {
        self.pending.remove(&message_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn command(n: u64) -> OutboundCommand {
        let payload = json!({ "type": "run_query", "n": n });
        OutboundCommand::new(payload.as_object().cloned().unwrap(), false, None)
    }

    #[test]
    fn fourth_command_is_rejected_at_capacity_three() {
        let mut queue = OutboundQueue::new(3);
        for n in 1..=3 {
            queue.push(command(n)).unwrap();
        }

        let rejected = queue.push(command(4)).unwrap_err();
        assert_eq!(rejected.payload["n"], json!(4));
        assert_eq!(queue.len(), 3);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|c| c.payload["n"].clone())
            .collect();
        assert_eq!(order, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn restored_commands_go_ahead_of_queued_ones() {
        let mut queue = OutboundQueue::new(2);
        queue.push(command(3)).unwrap();
        let first = command(1);
        let submitted_at = first.enqueued_at;

        queue.restore(command(2));
        queue.restore(first);
        assert_eq!(queue.len(), 3, "restoring ignores capacity");
        assert_eq!(queue.oldest(), Some(submitted_at));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|c| c.payload["n"].clone())
            .collect();
        assert_eq!(order, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn clearing_pending_drops_delivery_senders() {
        let (tx, mut rx) = oneshot::channel();
        let payload = json!({ "type": "run_query" }).as_object().cloned().unwrap();
        let mut tracker = AckTracker::default();
        tracker.track(1, OutboundCommand::new(payload, true, Some(tx)));

        tracker.clear();

        assert_eq!(tracker.len(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn resolve_reaches_the_sender() {
        let (tx, mut rx) = oneshot::channel();
        let payload = json!({ "type": "run_query" }).as_object().cloned().unwrap();
        OutboundCommand::new(payload, true, Some(tx)).resolve(Ok(7));

        assert_eq!(rx.try_recv().unwrap().unwrap(), 7);
    }
}
