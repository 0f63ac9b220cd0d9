//! WebSocket transport to the messaging gateway.
//!
//! Implements the [`Connector`] trait over `tokio-tungstenite`. Each link
//! gets a writer task draining the outbound channel into the socket and a
//! reader task forwarding text frames until the socket closes.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use matchsync_proto::message::UserId;

use super::{Connector, Frame, Link, LinkEvent, TransportError};
use crate::config::EndpointConfig;

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Opens WebSocket links to a gateway URL (`ws://` or `wss://`).
///
/// The acting user is passed as the `userId` query parameter.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    gateway_url: Url,
}

impl WebSocketConnector {
    /// Create a connector for the given gateway URL.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if `gateway_url` does not parse.
    pub fn new(gateway_url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            gateway_url: Url::parse(gateway_url)?,
        })
    }

    /// Create a connector for the configured gateway.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConfigured`] without a gateway URL and
    /// [`TransportError::InvalidUrl`] if it does not parse.
    pub fn from_endpoints(endpoints: &EndpointConfig) -> Result<Self, TransportError> {
        let url = endpoints
            .gateway_url
            .as_deref()
            .ok_or(TransportError::NotConfigured)?;
        Self::new(url)
    }

    /// Return the gateway URL this connector dials.
    #[must_use]
    pub const fn gateway_url(&self) -> &Url {
        &self.gateway_url
    }

    fn url_for(&self, user_id: UserId) -> Url {
        let mut url = self.gateway_url.clone();
        url.query_pairs_mut()
            .append_pair("userId", &user_id.to_string());
        url
    }
}

impl Connector for WebSocketConnector {
    async fn connect(&self, user_id: UserId) -> Result<Link, TransportError> {
        let url = self.url_for(user_id);
        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            tracing::warn!(url = %self.gateway_url, err = %e, "gateway WebSocket connect failed");
            map_ws_connect_error(e)
        })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(writer_loop(ws_sender, out_rx));
        tokio::spawn(reader_loop(ws_reader, in_tx));

        tracing::info!(url = %self.gateway_url, user_id = %user_id, "gateway WebSocket open");
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Background task that writes outbound frames to the socket.
///
/// Exits after a [`Frame::Close`], when the socket rejects a write, or when
/// the outbound channel is dropped (which also closes the socket).
async fn writer_loop(mut ws_sender: WsSender, mut outbound: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = outbound.recv().await {
        match frame {
            Frame::Text(text) => {
                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                    tracing::warn!(err = %e, "gateway write failed");
                    return;
                }
            }
            Frame::Close => break,
        }
    }
    let _ = ws_sender.close().await;
    tracing::debug!("gateway writer task exiting");
}

/// Background task that reads socket frames and forwards text payloads.
///
/// Binary frames are accepted if they are valid UTF-8. Always finishes by
/// emitting exactly one [`LinkEvent::Closed`].
async fn reader_loop(mut ws_reader: WsReader, inbound: mpsc::UnboundedSender<LinkEvent>) {
    let mut clean = false;
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if inbound.send(LinkEvent::Text(text.as_str().to_owned())).is_err() {
                    // Link dropped by the manager.
                    return;
                }
            }
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => {
                    if inbound.send(LinkEvent::Text(text)).is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(err = %e, "non UTF-8 binary frame, skipping"),
            },
            Ok(Message::Close(frame)) => {
                clean = frame.is_none_or(|f| f.code == CloseCode::Normal);
                tracing::info!(clean, "gateway WebSocket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "gateway WebSocket read error");
                break;
            }
        }
    }
    let _ = inbound.send(LinkEvent::Closed { clean });
    tracing::debug!("gateway reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(io_err.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "gateway HTTP error: status {}",
            response.status()
        ))),
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
        other => TransportError::Io(std::io::Error::other(format!(
            "gateway connection error: {other}"
        ))),
    }
}
