//! Follow one analysis run from submission to completion.
//!
//! Connects to the dashboard backend, submits a query that requires an
//! acknowledgment, and logs progress events until the run completes or fails.
//! Status changes (reconnects, switching to polling) are logged as they happen.
//!
//! ```sh
//! ANALYSIS_HOST=http://localhost:8080 ANALYSIS_SESSION_ID=... \
//!     RUST_LOG=info,analysis_realtime_client=debug \
//!     cargo run --example analysis_progress --features tracing
//! ```

use std::sync::Arc;
use std::time::Duration;

use analysis_realtime_client::ws::Config;
use analysis_realtime_client::{Client, Session, StaticSession};
use futures::StreamExt as _;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HOST_VAR: &str = "ANALYSIS_HOST";
const SESSION_VAR: &str = "ANALYSIS_SESSION_ID";

#[derive(Debug, Deserialize)]
struct Progress {
    percent: u8,
    #[serde(default)]
    stage: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let host = std::env::var(HOST_VAR).unwrap_or_else(|_| "http://localhost:8080".to_owned());
    let session_id = std::env::var(SESSION_VAR)?;
    let sessions = Arc::new(StaticSession::new(Session::new(session_id)));
    let client = Client::new(&host, Config::default(), sessions)?;

    let mut status = client.status_receiver();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(
                state = %current.state,
                reconnect_attempt = current.reconnect_attempt,
                fallback = current.fallback_active,
                queued = current.queue_depth,
                "Transport status"
            );
        }
    });

    client.on("analysis_failed", |event| {
        warn!(payload = ?event.payload, "Analysis failed");
    });

    let mut progress = Box::pin(client.events("analysis_progress"));
    let mut complete = Box::pin(client.events("analysis_complete"));
    client.session_created()?;

    let receipt = client
        .send(
            &json!({
                "type": "run_query",
                "sql": "SELECT region, SUM(revenue) FROM sales GROUP BY region",
            }),
            true,
        )
        .await?;
    info!(outcome = ?receipt.outcome, "Query submitted");
    if let Some(delivery) = receipt.delivery {
        match delivery.acknowledged().await {
            Ok(message_id) => info!(message_id, "Query acknowledged"),
            Err(e) => warn!(error = %e, "Query was not acknowledged"),
        }
    }

    let deadline = sleep(Duration::from_secs(300));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(event) = progress.next() => match event.payload_as::<Progress>() {
                Ok(p) => info!(percent = p.percent, stage = ?p.stage, "Progress"),
                Err(e) => warn!(error = %e, "Unexpected progress payload"),
            },
            Some(event) = complete.next() => {
                info!(payload = ?event.payload, "Analysis complete");
                break;
            }
            () = &mut deadline => {
                warn!("Gave up waiting for the analysis to finish");
                break;
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}
