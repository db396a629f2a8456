//! The physical WebSocket to the relay.
//!
//! One writer task owns the sink and drains a bounded queue. Every frame,
//! including heartbeat pings, goes through that queue.

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::TunnelError;

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Type alias for the WS sink to reduce verbosity.
type WsSink = SplitSink<RelayStream, Message>;

/// Frames queued for the writer before senders start waiting.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// How long `close` waits for queued frames to drain.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct PhysicalSocket {
    outbound: mpsc::Sender<Message>,
    inbound: SplitStream<RelayStream>,
    writer: JoinHandle<()>,
    writer_done: oneshot::Receiver<()>,
    writer_alive: bool,
    heartbeat: JoinHandle<()>,
}

impl PhysicalSocket {
    /// Open the relay socket and start the writer and heartbeat tasks.
    pub async fn connect(url: &str, heartbeat_interval: Duration) -> Result<Self, TunnelError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(Self::from_stream(ws_stream, heartbeat_interval))
    }

    fn from_stream(ws_stream: RelayStream, heartbeat_interval: Duration) -> Self {
        let (ws_sink, inbound) = ws_stream.split();
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (done_tx, writer_done) = oneshot::channel();
        let writer = tokio::spawn(async move {
            writer_loop(ws_sink, rx).await;
            let _ = done_tx.send(());
        });
        let heartbeat = tokio::spawn(heartbeat_loop(outbound.clone(), heartbeat_interval));
        Self {
            outbound,
            inbound,
            writer,
            writer_done,
            writer_alive: true,
            heartbeat,
        }
    }

    /// Queue handle for sending frames.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }

    /// Next binary frame from the relay. `None` once the relay closed the socket.
    pub async fn recv(&mut self) -> Option<Result<Bytes, TunnelError>> {
        loop {
            tokio::select! {
                msg = self.inbound.next() => {
                    match msg {
                        Some(Ok(Message::Binary(frame))) => return Some(Ok(frame)),
                        Some(Ok(Message::Close(frame))) => {
                            debug!("Tunnel: relay sent close: {frame:?}");
                            return None;
                        }
                        Some(Ok(Message::Text(_))) => {
                            warn!("Tunnel: ignoring text frame from relay");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Some(Err(e.into())),
                        None => return None,
                    }
                }
                _ = &mut self.writer_done, if self.writer_alive => {
                    self.writer_alive = false;
                    return Some(Err(TunnelError::SessionClosed));
                }
            }
        }
    }

    /// Send a close frame after already-queued frames, then stop both tasks.
    pub async fn close(self) {
        self.heartbeat.abort();
        let _ = self.outbound.send(Message::Close(None)).await;
        drop(self.outbound);
        let mut writer = self.writer;
        if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
    }
}

async fn writer_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            warn!("Tunnel: writer failed: {e}");
            return;
        }
        if is_close {
            return;
        }
    }
    let _ = sink.close().await;
}

async fn heartbeat_loop(outbound: mpsc::Sender<Message>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if outbound.send(Message::Ping(Bytes::new())).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_receive_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text("legacy".into())).await.unwrap();
            ws.send(Message::Binary(Bytes::from_static(b"\x01\x02"))).await.unwrap();
            ws.close(None).await.unwrap();
            first
        });

        let mut socket = PhysicalSocket::connect(&format!("ws://{addr}"), Duration::from_secs(30))
            .await
            .unwrap();
        socket
            .sender()
            .send(Message::Binary(Bytes::from_static(b"hello")))
            .await
            .unwrap();

        let frame = socket.recv().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"\x01\x02");
        assert!(socket.recv().await.is_none());
        socket.close().await;

        let first = server.await.unwrap();
        assert_eq!(first, Message::Binary(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = PhysicalSocket::connect(&format!("ws://{addr}"), Duration::from_secs(30)).await;
        assert!(matches!(result, Err(TunnelError::Connect(_))));
    }
}
