//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to simulate a gateway.
//! Created via [`loopback`], which returns a [`LoopbackConnector`] for the
//! engine and a [`LoopbackServer`] that the test drives: it accepts links,
//! reads what the client wrote, pushes events back and severs links.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use matchsync_proto::codec;
use matchsync_proto::gateway::{ClientCommand, GatewayEvent};
use matchsync_proto::message::UserId;

use super::{Connector, Frame, Link, LinkEvent, TransportError};

/// Connection switches shared by both ends of the loopback.
#[derive(Debug, Default)]
struct Switches {
    refusing: AtomicBool,
    stalling: AtomicBool,
    connects: AtomicUsize,
}

/// Client side of the loopback; hand this to the Connection Manager.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    accept_tx: mpsc::UnboundedSender<LoopbackPeer>,
    switches: Arc<Switches>,
}

/// Test-controlled gateway side of the loopback.
#[derive(Debug)]
pub struct LoopbackServer {
    accept_rx: Mutex<mpsc::UnboundedReceiver<LoopbackPeer>>,
    switches: Arc<Switches>,
}

/// Create a connected connector/server pair.
///
/// # Example
///
/// ```rust,no_run
/// use matchsync::transport::Connector;
/// use matchsync::transport::loopback::loopback;
/// use matchsync_proto::message::UserId;
///
/// # async fn example() {
/// let (connector, server) = loopback();
/// let link = connector.connect(UserId::new(1)).await.unwrap();
/// let peer = server.accept().await.unwrap();
/// assert_eq!(peer.user_id(), UserId::new(1));
/// # drop(link);
/// # }
/// ```
#[must_use]
pub fn loopback() -> (LoopbackConnector, LoopbackServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let switches = Arc::new(Switches::default());
    (
        LoopbackConnector {
            accept_tx,
            switches: Arc::clone(&switches),
        },
        LoopbackServer {
            accept_rx: Mutex::new(accept_rx),
            switches,
        },
    )
}

impl Connector for LoopbackConnector {
    async fn connect(&self, user_id: UserId) -> Result<Link, TransportError> {
        self.switches.connects.fetch_add(1, Ordering::SeqCst);

        if self.switches.stalling.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.switches.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("loopback".to_string()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let peer = LoopbackPeer {
            user_id,
            from_client: out_rx,
            to_client: in_tx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectionClosed)?;

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl LoopbackServer {
    /// Wait for the next link opened by the client.
    pub async fn accept(&self) -> Option<LoopbackPeer> {
        self.accept_rx.lock().await.recv().await
    }

    /// Make every following connect attempt fail immediately.
    pub fn refuse_connections(&self, refuse: bool) {
        self.switches.refusing.store(refuse, Ordering::SeqCst);
    }

    /// Make every following connect attempt hang forever.
    pub fn stall_connections(&self, stall: bool) {
        self.switches.stalling.store(stall, Ordering::SeqCst);
    }

    /// Number of connect attempts observed so far, successful or not.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.switches.connects.load(Ordering::SeqCst)
    }
}

/// Gateway end of one loopback link.
#[derive(Debug)]
pub struct LoopbackPeer {
    user_id: UserId,
    from_client: mpsc::UnboundedReceiver<Frame>,
    to_client: mpsc::UnboundedSender<LinkEvent>,
}

impl LoopbackPeer {
    /// The user the client connected as.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Next raw frame written by the client; `None` once the client dropped the link.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Next decodable command written by the client, skipping anything else.
    pub async fn recv_command(&mut self) -> Option<ClientCommand> {
        loop {
            match self.from_client.recv().await? {
                Frame::Text(text) => {
                    if let Ok(cmd) = codec::decode_command(&text) {
                        return Some(cmd);
                    }
                }
                Frame::Close => return None,
            }
        }
    }

    /// Push a raw text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Text(text.into())).is_ok()
    }

    /// Push an encoded gateway event to the client.
    pub fn send_event(&self, event: &GatewayEvent) -> bool {
        match codec::encode_event(event) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Close the link from the gateway side.
    ///
    /// `clean == false` simulates a dropped network connection.
    pub fn close(self, clean: bool) {
        let _ = self.to_client.send(LinkEvent::Closed { clean });
    }
}
