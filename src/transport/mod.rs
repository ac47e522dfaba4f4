pub mod inmem;
pub mod ws;

use std::fmt;

use tokio::sync::mpsc;

/// Logical peer name used by the sync layer: a relay ID or the
/// authoritative "cloud" endpoint.
pub type PeerId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    ConnectionClosed,
    Io(String),
    Backpressure,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionClosed => write!(f, "connection closed"),
            TransportError::Io(e) => write!(f, "io: {e}"),
            TransportError::Backpressure => write!(f, "backpressure"),
        }
    }
}

/// One bidirectional frame stream to a peer. `recv` hands out the
/// receive side exactly once; later calls return a closed channel.
#[async_trait::async_trait]
pub trait PeerConn: Send + Sync {
    async fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
    fn recv(&self) -> mpsc::Receiver<Vec<u8>>;
    async fn close(&self);
}
