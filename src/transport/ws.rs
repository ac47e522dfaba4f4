use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async, connect_async,
    tungstenite::handshake::server::{ErrorResponse, Request, Response},
    tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use super::{PeerConn, PeerId, TransportError};

/*──────────── outbound connection ─────────────*/

type ClientSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;
type ServerSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

enum Sink {
    Client(ClientSink),
    Server(ServerSink),
}

impl Sink {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        let result = match self {
            Sink::Client(s) => s.send(msg).await,
            Sink::Server(s) => s.send(msg).await,
        };
        result.map_err(|e| TransportError::Io(format!("ws send: {e}")))
    }
}

pub struct WsConn {
    writer: tokio::sync::Mutex<Sink>,
    rx_once: std::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

#[async_trait::async_trait]
impl PeerConn for WsConn {
    async fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.writer.lock().await.send(Message::Binary(bytes)).await
    }

    fn recv(&self) -> mpsc::Receiver<Vec<u8>> {
        let mut guard = self.rx_once.lock().expect("poisoned");
        if let Some(rx) = guard.take() {
            rx
        } else {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.send(Message::Close(None)).await;
    }
}

fn spawn_reader<S>(mut reader: S) -> mpsc::Receiver<Vec<u8>>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel::<Vec<u8>>(1024);
    tokio::spawn(async move {
        while let Some(msg) = reader.next().await {
            match msg {
                Ok(Message::Binary(b)) => {
                    if tx.send(b).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Text(s)) => {
                    if tx.send(s.into_bytes()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        debug!("ws: reader exit");
    });
    rx
}

/// Dials a peer's sync endpoint, e.g. `ws://host:port/sync?peer=relay1`
/// where `peer` names the caller.
pub async fn dial(url: &str) -> Result<Arc<dyn PeerConn>, TransportError> {
    let (ws, _resp) = connect_async(url)
        .await
        .map_err(|e| TransportError::Io(format!("ws connect: {e}")))?;
    let (writer, reader) = ws.split();
    let rx = spawn_reader(reader);

    Ok(Arc::new(WsConn {
        writer: tokio::sync::Mutex::new(Sink::Client(writer)),
        rx_once: std::sync::Mutex::new(Some(rx)),
    }))
}

/// Upgrades one accepted TCP stream on `GET /sync`. The dialer names
/// itself in the `peer` query parameter; the returned connection is
/// handed to the sync controller under that name.
pub async fn accept(stream: TcpStream) -> Result<(PeerId, Arc<dyn PeerConn>), TransportError> {
    let peer = Arc::new(std::sync::Mutex::new(None::<String>));
    let peer_capture = peer.clone();

    let ws = accept_hdr_async(stream, move |request: &Request, response: Response| {
        let uri = request.uri();
        if uri.path() != "/sync" {
            return Err(ErrorResponse::new(Some("no such endpoint".into())));
        }
        let peer_id = uri.query().and_then(|q| {
            q.split('&')
                .find_map(|kv| kv.strip_prefix("peer=").map(|v| v.to_string()))
        });
        match peer_id {
            Some(id) if !id.is_empty() => {
                *peer_capture.lock().unwrap() = Some(id);
                Ok(response)
            }
            _ => Err(ErrorResponse::new(Some("missing peer id".into()))),
        }
    })
    .await
    .map_err(|e| TransportError::Io(format!("ws accept: {e}")))?;

    let peer_id = peer
        .lock()
        .unwrap()
        .take()
        .ok_or_else(|| TransportError::Io("missing peer id".into()))?;

    let (writer, reader) = ws.split();
    let rx = spawn_reader(reader);

    Ok((
        peer_id,
        Arc::new(WsConn {
            writer: tokio::sync::Mutex::new(Sink::Server(writer)),
            rx_once: std::sync::Mutex::new(Some(rx)),
        }),
    ))
}

/// Accept loop for a node's sync listener. Each upgraded connection is
/// handed to `on_peer`.
pub async fn serve<F>(listener: TcpListener, on_peer: F)
where
    F: Fn(PeerId, Arc<dyn PeerConn>) + Send + Sync + 'static,
{
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(%e, "ws: accept failed");
                break;
            }
        };
        match accept(stream).await {
            Ok((peer_id, conn)) => on_peer(peer_id, conn),
            Err(e) => debug!(%addr, %e, "ws: handshake rejected"),
        }
    }
}
