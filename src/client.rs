use std::sync::Arc;

use futures::Stream;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use crate::Result;
use crate::session::{self, SessionProvider};
use crate::subscription::{self, Registry, SubscriptionToken};
use crate::ws::connection::{Actor, Command, Spawned, Submitted};
use crate::ws::queue::DeliveryResult;
use crate::ws::{Config, InboundEvent, SendOutcome, Status, TransportError, codec};

/// Real-time transport client for the analysis dashboard.
///
/// Keeps at most one channel to `{host}/ws/{sessionId}` open, reconnects with
/// a bounded backoff, falls back to polling `{host}/api/events/poll` once the
/// reconnection budget is spent, and routes every inbound event to the
/// handlers registered for its type.
///
/// [`Client`] is cheap to clone; all clones drive the same channel. Dropping
/// the last clone shuts the channel down as [`Client::disconnect`] would.
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use analysis_realtime_client::ws::Config;
/// use analysis_realtime_client::{Client, Session, StaticSession};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> analysis_realtime_client::Result<()> {
///     let sessions = Arc::new(StaticSession::new(Session::new("5f0c2a")));
///     let client = Client::new("https://analysis.example.com", Config::default(), sessions)?;
///
///     client.on("analysis_complete", |event| println!("done: {:?}", event.payload));
///     client.connect()?;
///
///     let receipt = client
///         .send(&json!({ "type": "run_query", "sql": "SELECT 1" }), true)
///         .await?;
///     if let Some(delivery) = receipt.delivery {
///         let message_id = delivery.acknowledged().await?;
///         println!("acknowledged as {message_id}");
///     }
///
///     client.disconnect().await
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    registry: Arc<Registry>,
}

impl Client {
    /// Create a client for the dashboard served at `host` and start its
    /// background task. Nothing is opened until [`Client::connect`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(host: &str, config: Config, sessions: Arc<dyn SessionProvider>) -> Result<Self> {
        config.validate()?;
        let host = Url::parse(host)?;
        session::channel_scheme(&host)?;

        let registry = Arc::new(Registry::default());
        let Spawned { commands, status } =
            Actor::spawn(host, config, sessions, Arc::clone(&registry))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                commands,
                status,
                registry,
            }),
        })
    }

    /// Open the channel. A no-op while it is already open or opening.
    ///
    /// Resets the reconnection budget and re-enables automatic reconnection
    /// after a [`Client::disconnect`].
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    /// Hook for the upload flow: a session now exists, so open the channel.
    pub fn session_created(&self) -> Result<()> {
        self.connect()
    }

    /// Close the channel with code 1000 and stop every background activity.
    ///
    /// Queued commands and commands awaiting acknowledgment are dropped; their
    /// [`Delivery`] handles resolve with [`TransportError::Disconnected`].
    /// Returns once every timer is cleared and the fallback poller has stopped.
    pub async fn disconnect(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.command(Command::Disconnect { done })?;
        rx.await.map_err(|_e| TransportError::Disconnected)?;
        Ok(())
    }

    /// Send a command, or queue it until the channel opens.
    ///
    /// `command` must serialize to a JSON object with a string `type` other
    /// than `ping`, `pong` or `ack`, and must not set `messageId`.
    pub async fn send<R: Serialize>(&self, command: &R, requires_ack: bool) -> Result<SendReceipt> {
        let payload = codec::command_payload(command)?;
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            payload,
            requires_ack,
            reply,
        })?;

        let Submitted { outcome, delivery } =
            rx.await.map_err(|_e| TransportError::Disconnected)?;
        Ok(SendReceipt {
            outcome,
            delivery: delivery.map(|rx| Delivery { rx }),
        })
    }

    /// Register `handler` for events of `event_type`. Handlers for one type
    /// run in registration order on the client's background task and must
    /// not block.
    pub fn on<F>(&self, event_type: &str, handler: F) -> SubscriptionToken
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.inner.registry.on(event_type, Arc::new(handler))
    }

    /// Remove a handler. Returns `false` if it was already removed.
    pub fn off(&self, token: &SubscriptionToken) -> bool {
        self.inner.registry.off(token)
    }

    /// Stream of events of `event_type`; the subscription ends when the stream is dropped.
    pub fn events(&self, event_type: &str) -> impl Stream<Item = InboundEvent> + use<> {
        subscription::event_stream(&self.inner.registry, event_type)
    }

    /// Current diagnostic snapshot.
    #[must_use]
    pub fn status(&self) -> Status {
        *self.inner.status.borrow()
    }

    /// Receiver notified whenever the diagnostic snapshot changes.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<Status> {
        self.inner.status.clone()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_e| TransportError::Disconnected)?;
        Ok(())
    }
}

/// Result of [`Client::send`].
#[non_exhaustive]
#[derive(Debug)]
pub struct SendReceipt {
    pub outcome: SendOutcome,
    /// Present for accepted commands sent with `requires_ack`
    pub delivery: Option<Delivery>,
}

/// Resolves once an acknowledgment-required command is acknowledged, or
/// fails for good.
#[derive(Debug)]
#[must_use = "a delivery does nothing unless awaited"]
pub struct Delivery {
    rx: oneshot::Receiver<DeliveryResult>,
}

impl Delivery {
    /// The `messageId` the server acknowledged, or why the command was not
    /// acknowledged: [`TransportError::DeliveryFailed`] after a single retry,
    /// [`TransportError::Disconnected`] if the client was disconnected first.
    pub async fn acknowledged(self) -> Result<u64> {
        match self.rx.await {
            Ok(Ok(message_id)) => Ok(message_id),
            Ok(Err(e)) => Err(e.into()),
            Err(_closed) => Err(TransportError::Disconnected.into()),
        }
    }
}
