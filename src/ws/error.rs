#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// Real-time transport error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Error parsing a WebSocket frame
    MessageParse(serde_json::Error),
    /// Received a frame that is valid JSON but not a valid message
    InvalidMessage(String),
    /// The channel was closed, optionally with the close code sent by the peer
    ConnectionClosed {
        /// Close code carried by the close frame, if any
        code: Option<u16>,
    },
    /// The WebSocket handshake did not complete in time
    HandshakeTimeout,
    /// No liveness response was observed within the heartbeat timeout
    HeartbeatTimeout,
    /// A command requiring acknowledgment was not acknowledged after its retry
    DeliveryFailed {
        /// Identifier the command was transmitted with
        message_id: u64,
    },
    /// The client was disconnected, or shut down, before the command was resolved
    Disconnected,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket frame: {e}"),
            Self::InvalidMessage(msg) => write!(f, "Invalid WebSocket frame: {msg}"),
            Self::ConnectionClosed { code: Some(code) } => {
                write!(f, "WebSocket connection closed with code {code}")
            }
            Self::ConnectionClosed { code: None } => write!(f, "WebSocket connection closed"),
            Self::HandshakeTimeout => write!(f, "WebSocket handshake timed out"),
            Self::HeartbeatTimeout => write!(f, "No heartbeat response received in time"),
            Self::DeliveryFailed { message_id } => {
                write!(f, "Command {message_id} was not acknowledged after retry")
            }
            Self::Disconnected => write!(f, "Client disconnected before the command resolved"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<TransportError> for crate::error::Error {
    fn from(e: TransportError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Transport, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(
            crate::error::Kind::Transport,
            TransportError::Connection(e),
        )
    }
}
