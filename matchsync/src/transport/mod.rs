//! Duplex transport abstraction for the messaging gateway.
//!
//! Defines the [`Connector`] trait the Connection Manager uses to open
//! links. Concrete implementations include:
//! - [`websocket::WebSocketConnector`]: WebSocket connection to a real gateway
//! - [`loopback::LoopbackConnector`]: in-process channels for testing
//!
//! A [`Link`] only moves text frames in both directions
//! and reports exactly one [`LinkEvent::Closed`] when it goes away. All
//! protocol knowledge lives in the Connection Manager.

pub mod loopback;
pub mod websocket;

use tokio::sync::mpsc;

use matchsync_proto::message::UserId;

/// Errors that can occur while opening a link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed during setup.
    #[error("connection closed")]
    ConnectionClosed,

    /// The gateway could not be reached.
    #[error("gateway {0} is unreachable")]
    Unreachable(String),

    /// No gateway URL is configured.
    #[error("no gateway url configured")]
    NotConfigured,

    /// The configured gateway URL is not valid.
    #[error("invalid gateway url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame written by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A JSON text frame.
    Text(String),
    /// Request a clean close of the link.
    Close,
}

/// Something that happened on the read side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A JSON text frame from the gateway.
    Text(String),
    /// The link is gone. `clean` is `true` for a normal close handshake.
    Closed {
        /// Whether the close was orderly.
        clean: bool,
    },
}

/// An open duplex link to the gateway.
///
/// Dropping `outbound` closes the link from the client side.
#[derive(Debug)]
pub struct Link {
    /// Frames to write to the gateway.
    pub outbound: mpsc::UnboundedSender<Frame>,
    /// Frames and the final close notification from the gateway.
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens links to the messaging gateway on behalf of a user.
///
/// Implementations only establish the link; timeouts, retries and
/// reference counting are the caller's concern.
pub trait Connector: Send + Sync + 'static {
    /// Open a new link authenticated as `user_id`.
    fn connect(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<Link, TransportError>> + Send;
}
