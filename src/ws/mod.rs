//! Real-time channel infrastructure.
//!
//! # Architecture
//!
//! - `codec`: JSON frame encoding and decoding
//! - `machine`: synchronous lifecycle state machine, returning the actions a
//!   transition requires
//! - `connection`: the tokio task that owns the socket and every timer and
//!   executes those actions
//! - [`Config`], [`ReconnectConfig`]: tuning for heartbeat, acknowledgment,
//!   queueing, reconnection and fallback polling

pub(crate) mod codec;
pub mod config;
pub(crate) mod connection;
pub mod error;
pub(crate) mod heartbeat;
pub(crate) mod machine;
pub(crate) mod queue;
pub mod reconnect;
pub mod state;

pub use codec::InboundEvent;
pub use config::{Config, ReconnectConfig};
pub use error::TransportError;
pub use machine::{HEARTBEAT_TIMEOUT_CLOSURE, NORMAL_CLOSURE, SendOutcome};
pub use reconnect::BackoffTable;
pub use state::{ConnectionState, Status};
