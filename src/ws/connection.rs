use std::collections::{HashMap, VecDeque};
use std::future::pending;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{SinkExt as _, StreamExt as _};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until, timeout};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;
use url::Url;

use super::codec::InboundEvent;
use super::config::Config;
use super::error::TransportError;
use super::machine::{Action, HEARTBEAT_TIMEOUT_CLOSURE, Machine, SendOutcome};
use super::queue::DeliveryResult;
use super::state::Status;
use crate::Result;
use crate::error::Error;
use crate::fallback::{FallbackPoller, PollBatch, PollSource};
use crate::session::{self, SessionProvider};
use crate::subscription::Registry;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handshake = BoxFuture<'static, Result<WsStream>>;

/// Requests from client handles to the connection actor.
pub(crate) enum Command {
    Connect,
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Send {
        payload: Map<String, Value>,
        requires_ack: bool,
        reply: oneshot::Sender<Submitted>,
    },
}

/// The actor's answer to [`Command::Send`].
pub(crate) struct Submitted {
    pub(crate) outcome: SendOutcome,
    pub(crate) delivery: Option<oneshot::Receiver<DeliveryResult>>,
}

/// Something the actor woke up for.
enum Step {
    Command(Command),
    Handshake(Result<WsStream>),
    Frame(Option<std::result::Result<Message, tungstenite::Error>>),
    ReconnectDue,
    HeartbeatTick(Instant),
    HeartbeatDeadline,
    AckTimeout(u64),
    Polled(PollBatch),
}

/// Handles to a running actor.
pub(crate) struct Spawned {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) status: watch::Receiver<Status>,
}

/// Owns the channel and every timer; the only place [`Machine`] transitions
/// are executed.
///
/// Each suspension point is a branch of a single `select!`, so transitions
/// never interleave.
pub(crate) struct Actor {
    host: Url,
    config: Config,
    sessions: Arc<dyn SessionProvider>,
    registry: Arc<Registry>,
    machine: Machine,
    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<Status>,

    opening: Option<Handshake>,
    socket: Option<WsStream>,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
    ack_timers: DelayQueue<u64>,
    ack_keys: HashMap<u64, Key>,

    poll_source: PollSource,
    poller: Option<FallbackPoller>,
    poll_generation: u64,
    poll_tx: mpsc::UnboundedSender<PollBatch>,
    poll_rx: mpsc::UnboundedReceiver<PollBatch>,
}

impl Actor {
    /// Start the actor on the current tokio runtime.
    pub(crate) fn spawn(
        host: Url,
        config: Config,
        sessions: Arc<dyn SessionProvider>,
        registry: Arc<Registry>,
    ) -> Result<Spawned> {
        let poll_source = PollSource::new(&host, Arc::clone(&sessions), &config)?;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::default());
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();

        let actor = Self {
            machine: Machine::new(&config),
            host,
            config,
            sessions,
            registry,
            commands,
            status_tx,
            opening: None,
            socket: None,
            reconnect_at: None,
            heartbeat: None,
            ack_timers: DelayQueue::new(),
            ack_keys: HashMap::new(),
            poll_source,
            poller: None,
            poll_generation: 0,
            poll_tx,
            poll_rx,
        };
        tokio::spawn(actor.run());

        Ok(Spawned {
            commands: commands_tx,
            status: status_rx,
        })
    }

    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => break,
                },
                result = handshake(&mut self.opening) => Step::Handshake(result),
                frame = next_frame(&mut self.socket) => Step::Frame(frame),
                () = sleep_until_some(self.reconnect_at) => Step::ReconnectDue,
                now = tick(&mut self.heartbeat) => Step::HeartbeatTick(now),
                () = sleep_until_some(self.machine.heartbeat_deadline()) => Step::HeartbeatDeadline,
                Some(expired) = self.ack_timers.next() => Step::AckTimeout(expired.into_inner()),
                Some(batch) = self.poll_rx.recv() => Step::Polled(batch),
            };

            self.handle(step).await;
            self.publish_status();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("All client handles dropped, shutting down");

        let actions = self.machine.disconnect();
        self.apply(actions).await;
        self.publish_status();
    }

    async fn handle(&mut self, step: Step) {
        let actions = match step {
            Step::Command(Command::Connect) => self.machine.connect(),
            Step::Command(Command::Disconnect { done }) => {
                let actions = self.machine.disconnect();
                self.apply(actions).await;
                self.publish_status();
                _ = done.send(());
                return;
            }
            Step::Command(Command::Send {
                payload,
                requires_ack,
                reply,
            }) => {
                let (mut outcome, delivery, actions) = self.machine.send(payload, requires_ack);
                self.apply(actions).await;
                if outcome == SendOutcome::Sent && !self.machine.status().connected {
                    // The write failed and the command went back to the queue
                    outcome = SendOutcome::Queued;
                }
                self.publish_status();
                _ = reply.send(Submitted { outcome, delivery });
                return;
            }
            Step::Handshake(result) => {
                self.opening = None;
                match result {
                    Ok(stream) => {
                        self.socket = Some(stream);
                        self.machine.opened(Instant::now())
                    }
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %e, "Unable to open channel");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                        self.machine.closed(None)
                    }
                }
            }
            Step::Frame(Some(Ok(Message::Text(text)))) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(%text, "Received frame");

                let (actions, event) = self.machine.frame_received(text.as_str(), Instant::now());
                if let Some(event) = event {
                    self.dispatch(&event);
                }
                actions
            }
            Step::Frame(Some(Ok(Message::Close(frame)))) => {
                let code = frame.map(|frame| u16::from(frame.code));
                #[cfg(feature = "tracing")]
                {
                    let reason = TransportError::ConnectionClosed { code };
                    tracing::debug!(%reason, "Server closed channel");
                }

                if let Some(mut socket) = self.socket.take() {
                    // Sends the queued close reply
                    _ = socket.flush().await;
                }
                self.machine.closed(code)
            }
            Step::Frame(Some(Ok(_))) => Vec::new(),
            Step::Frame(Some(Err(e))) => {
                let error = TransportError::Connection(e);
                #[cfg(feature = "tracing")]
                tracing::warn!(%error, "Channel failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &error;

                self.socket = None;
                self.machine.closed(None)
            }
            Step::Frame(None) => {
                self.socket = None;
                self.machine.closed(None)
            }
            Step::ReconnectDue => {
                self.reconnect_at = None;
                self.machine.reconnect_due()
            }
            Step::HeartbeatTick(now) => self.machine.heartbeat_tick(now),
            Step::HeartbeatDeadline => self.machine.heartbeat_expired(Instant::now()),
            Step::AckTimeout(message_id) => {
                self.ack_keys.remove(&message_id);
                self.machine.ack_timed_out(message_id)
            }
            Step::Polled((generation, events)) => {
                if generation == self.poll_generation && self.machine.is_fallback_active() {
                    for event in &events {
                        self.dispatch(event);
                    }
                }
                Vec::new()
            }
        };

        self.apply(actions).await;
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        let mut work = VecDeque::from(actions);

        while let Some(action) = work.pop_front() {
            match action {
                Action::Open => self.open(),
                Action::Transmit(text) => {
                    if let Err(e) = self.transmit(text).await {
                        self.write_failed(&e, &mut work);
                    }
                }
                Action::Deliver(text) => match self.transmit(text).await {
                    Ok(()) => work.extend(self.machine.delivered()),
                    Err(e) => self.write_failed(&e, &mut work),
                },
                Action::ArmAck(message_id) => {
                    let key = self.ack_timers.insert(message_id, self.config.ack_timeout);
                    if let Some(previous) = self.ack_keys.insert(message_id, key) {
                        _ = self.ack_timers.try_remove(&previous);
                    }
                }
                Action::CancelAck(message_id) => {
                    if let Some(key) = self.ack_keys.remove(&message_id) {
                        _ = self.ack_timers.try_remove(&key);
                    }
                }
                Action::ClearAcks => {
                    self.ack_timers.clear();
                    self.ack_keys.clear();
                }
                Action::StartHeartbeat => {
                    let period = self.config.heartbeat_interval;
                    let mut ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.heartbeat = Some(ticker);
                }
                Action::StopHeartbeat => self.heartbeat = None,
                Action::Close(code) => self.close(code).await,
                Action::ScheduleReconnect(delay) => {
                    self.reconnect_at = Some(Instant::now() + delay);
                }
                Action::CancelReconnect => self.reconnect_at = None,
                Action::StartFallback => self.start_fallback().await,
                Action::StopFallback => self.stop_fallback().await,
            }
        }
    }

    /// Drop the socket along with every write still waiting in `work`; the
    /// machine keeps the commands that were not written.
    fn write_failed(&mut self, error: &TransportError, work: &mut VecDeque<Action>) {
        #[cfg(feature = "tracing")]
        tracing::warn!(%error, "Unable to write frame");
        #[cfg(not(feature = "tracing"))]
        let _ = error;

        self.socket = None;
        work.retain(|action| !matches!(action, Action::Transmit(_) | Action::Deliver(_)));
        work.extend(self.machine.write_failed());
    }

    fn dispatch(&self, event: &InboundEvent) {
        if self.registry.dispatch(event) == 0 {
            #[cfg(feature = "tracing")]
            tracing::trace!(event_type = %event.event_type, "No handlers for event");
        }
    }

    fn open(&mut self) {
        let sessions = Arc::clone(&self.sessions);
        let host = self.host.clone();
        let connect_timeout = self.config.connect_timeout;

        #[cfg(feature = "tracing")]
        tracing::debug!(%host, attempt = self.machine.status().reconnect_attempt, "Opening channel");

        self.opening = Some(Box::pin(async move {
            let session = session::acquire(sessions.as_ref()).await?;
            let url = session::channel_url(&host, &session)?;
            let (stream, _) = timeout(connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_elapsed| TransportError::HandshakeTimeout)??;
            Ok::<_, Error>(stream)
        }));
    }

    async fn transmit(&mut self, text: String) -> std::result::Result<(), TransportError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(TransportError::ConnectionClosed { code: None });
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(%text, "Sending frame");

        socket
            .send(Message::Text(text.into()))
            .await
            .map_err(TransportError::Connection)
    }

    async fn close(&mut self, code: u16) {
        self.opening = None;

        let Some(mut socket) = self.socket.take() else {
            return;
        };
        let reason = if code == HEARTBEAT_TIMEOUT_CLOSURE {
            "heartbeat timeout"
        } else {
            "client disconnect"
        };
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Utf8Bytes::from_static(reason),
        };

        match timeout(self.config.close_timeout, socket.close(Some(frame))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, code, "Error while closing channel");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
            Err(_elapsed) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(code, "Timed out sending close frame");
            }
        }
    }

    async fn start_fallback(&mut self) {
        self.stop_fallback().await;
        self.poll_generation += 1;
        self.poller = Some(FallbackPoller::start(
            self.poll_source.clone(),
            self.config.poll_interval,
            self.poll_generation,
            self.poll_tx.clone(),
        ));
    }

    async fn stop_fallback(&mut self) {
        if let Some(poller) = self.poller.take() {
            // Batches already in flight belong to the old generation and are discarded
            self.poll_generation += 1;
            poller.stop().await;
        }
    }

    fn publish_status(&self) {
        let status = self.machine.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn handshake(opening: &mut Option<Handshake>) -> Result<WsStream> {
    match opening {
        Some(handshake) => handshake.await,
        None => pending().await,
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<std::result::Result<Message, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) -> Instant {
    match heartbeat {
        Some(ticker) => ticker.tick().await,
        None => pending().await,
    }
}
