use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{PeerConn, TransportError};

/// In-memory stand-in for a peer's frame stream: the two endpoints of
/// one bidirectional pipe. Tests hand one endpoint to each sync
/// controller, registered under the opposite side's peer name.
pub fn pipe(capacity: usize) -> (Arc<dyn PeerConn>, Arc<dyn PeerConn>) {
    let (left_tx, left_rx) = mpsc::channel(capacity);
    let (right_tx, right_rx) = mpsc::channel(capacity);

    (
        Arc::new(PipeEnd {
            tx: left_tx,
            rx: Mutex::new(Some(right_rx)),
        }),
        Arc::new(PipeEnd {
            tx: right_tx,
            rx: Mutex::new(Some(left_rx)),
        }),
    )
}

struct PipeEnd {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

#[async_trait::async_trait]
impl PeerConn for PipeEnd {
    async fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send(bytes)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn recv(&self) -> mpsc::Receiver<Vec<u8>> {
        let mut rx = self.rx.lock().unwrap();
        match rx.take() {
            Some(rx) => rx,
            None => {
                let (_closed_tx, closed_rx) = mpsc::channel(1);
                closed_rx
            }
        }
    }

    async fn close(&self) {
        // refuse further inbound traffic; our peer's sends start failing
        self.rx.lock().unwrap().take();
    }
}
