//! HTTP polling used while the real-time channel is unavailable.
//!
//! The poller only fetches and decodes; batches are handed to the connection
//! actor, which dispatches them through the same registry as channel events.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Result;
use crate::session::{self, SessionProvider};
use crate::ws::codec::{self, Frame};
use crate::ws::{Config, InboundEvent};

/// Events fetched by one poll, tagged with the generation of the poller that fetched them.
pub(crate) type PollBatch = (u64, Vec<InboundEvent>);

/// Everything needed to issue a catch-up request.
#[derive(Clone)]
pub(crate) struct PollSource {
    http: reqwest::Client,
    url: Url,
    sessions: Arc<dyn SessionProvider>,
}

impl PollSource {
    pub(crate) fn new(
        host: &Url,
        sessions: Arc<dyn SessionProvider>,
        config: &Config,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.poll_timeout)
            .build()?;

        Ok(Self {
            http,
            url: session::poll_url(host)?,
            sessions,
        })
    }

    /// Fetch the events the server buffered since the last poll.
    ///
    /// Reserved frame types and malformed entries are dropped.
    pub(crate) async fn poll_once(&self) -> Result<Vec<InboundEvent>> {
        let session = session::acquire(self.sessions.as_ref()).await?;
        let request = self.http.request(Method::GET, self.url.clone()).build()?;
        let entries: Vec<Value> =
            crate::request(&self.http, request, Some(session.headers()?)).await?;

        let events = entries
            .into_iter()
            .filter_map(|entry| match codec::decode_value(entry) {
                Ok(Frame::Event(event)) => Some(event),
                Ok(_) => None,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Dropping malformed polled event");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                    None
                }
            })
            .collect();

        Ok(events)
    }
}

/// Handle to the background polling task.
pub(crate) struct FallbackPoller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl FallbackPoller {
    /// Spawn the polling task. The first poll is issued immediately.
    pub(crate) fn start(
        source: PollSource,
        interval: Duration,
        generation: u64,
        batches: mpsc::UnboundedSender<PollBatch>,
    ) -> Self {
        let token = CancellationToken::new();
        let token_clone = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            #[cfg(feature = "tracing")]
            tracing::debug!(generation, ?interval, url = %source.url, "Fallback polling started");

            loop {
                tokio::select! {
                    () = token_clone.cancelled() => break,
                    _ = ticker.tick() => {
                        // A request in flight is abandoned as soon as the poller is stopped
                        let polled = tokio::select! {
                            () = token_clone.cancelled() => break,
                            polled = source.poll_once() => polled,
                        };

                        match polled {
                            Ok(events) if events.is_empty() => {}
                            Ok(events) => {
                                #[cfg(feature = "tracing")]
                                tracing::trace!(generation, count = events.len(), "Polled events");
                                if batches.send((generation, events)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                #[cfg(feature = "tracing")]
                                tracing::warn!(error = %e, "Fallback poll failed, retrying next tick");
                                #[cfg(not(feature = "tracing"))]
                                let _ = &e;
                            }
                        }
                    }
                }
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(generation, "Fallback polling stopped");
        });

        Self { token, handle }
    }

    /// Cancel the task and wait for it to finish.
    pub(crate) async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %e, "Fallback polling task failed");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }
}
