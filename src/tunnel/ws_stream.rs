//! WebSocket logical stream: relays one local WebSocket through envelopes.
//!
//! Relay frames that arrive while the local socket is still opening wait in
//! the stream's inbox and are forwarded in order once it is open.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::codec::{OpenDetails, WebStreamMsg, WsFrameType};
use super::compression::{attach_payload, message_payload, should_compress_frame};
use super::headers::gather_websocket_headers;
use super::stream::{StreamContext, StreamLink};
use crate::error::TunnelError;

type LocalSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Drive one WebSocket stream from its open message to its close.
pub async fn run(
    link: StreamLink,
    ctx: Arc<StreamContext>,
    mut inbox: mpsc::UnboundedReceiver<WebStreamMsg>,
) {
    let Some(first) = inbox.recv().await else {
        return;
    };
    let Some(open) = first.open.clone() else {
        warn!(stream_id = link.id(), "Stream: first message was not an open message");
        link.close(false).await;
        return;
    };

    let headers = gather_websocket_headers(&first.headers.clone().unwrap_or_default());
    let Some(local) = connect_local(&link, &ctx, &open, &headers).await else {
        link.fail(true).await;
        return;
    };
    if link.is_closed() {
        debug!(stream_id = link.id(), "Stream: relay closed before local socket opened");
        return;
    }

    let (mut local_tx, mut local_rx) = local.split();
    if !first.data.is_empty() {
        if let Err(e) = forward_to_local(&mut local_tx, &first).await {
            warn!(stream_id = link.id(), "Stream: {e}");
            link.close(false).await;
            return;
        }
    }

    loop {
        tokio::select! {
            msg = inbox.recv() => {
                let Some(msg) = msg else {
                    // Relay closed the stream.
                    let _ = local_tx.send(Message::Close(None)).await;
                    break;
                };
                if msg.is_close_message {
                    let _ = local_tx.send(Message::Close(None)).await;
                    break;
                }
                match forward_to_local(&mut local_tx, &msg).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        if !link.is_closed() {
                            warn!(stream_id = link.id(), "Stream: {e}");
                        }
                        break;
                    }
                }
            }
            frame = local_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let data = Bytes::from(text);
                        if send_to_relay(&link, data, WsFrameType::Text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if send_to_relay(&link, data, WsFrameType::Binary).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(stream_id = link.id(), "Stream: local socket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        if !link.is_closed() {
                            info!(stream_id = link.id(), "Stream: local socket error: {e}");
                        }
                        break;
                    }
                }
            }
        }
    }
    link.close(false).await;
}

/// Try each candidate in order until one accepts the upgrade.
async fn connect_local(
    link: &StreamLink,
    ctx: &StreamContext,
    open: &OpenDetails,
    headers: &[(String, String)],
) -> Option<LocalSocket> {
    for candidate in ctx.resolver.ws_candidates(&open.path, open.path_type) {
        let mut request = match candidate.url.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                warn!(stream_id = link.id(), url = %candidate.url, "Stream: bad local ws url: {e}");
                continue;
            }
        };
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                request.headers_mut().insert(name, value);
            }
        }

        let connector = Connector::NativeTls(ctx.ws_tls.clone());
        let attempt = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            Some(connector),
        );
        match tokio::time::timeout(ctx.ws_open_timeout, attempt).await {
            Ok(Ok((socket, _response))) => {
                debug!(stream_id = link.id(), url = %candidate.url, "Stream: local websocket open");
                return Some(socket);
            }
            Ok(Err(e)) => {
                info!(stream_id = link.id(), "Stream: local {} websocket failed: {e}", candidate.label);
            }
            Err(_) => {
                info!(stream_id = link.id(), "Stream: local {} websocket timed out", candidate.label);
            }
        }
        if link.is_closed() {
            return None;
        }
    }
    warn!(stream_id = link.id(), "Stream: no local websocket for {}", open.path);
    None
}

/// Write one relay frame to the local socket. Returns false after a close frame.
async fn forward_to_local<S>(local_tx: &mut S, msg: &WebStreamMsg) -> Result<bool, TunnelError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let id = msg.stream_id;
    let payload = message_payload(msg).map_err(|e| TunnelError::stream(id, e.to_string()))?;
    let (frame, keep_open) = match msg.ws_frame_type {
        Some(WsFrameType::Text) => {
            let text = String::from_utf8(payload.to_vec())
                .map_err(|_| TunnelError::stream(id, "text frame is not valid utf-8"))?;
            (Message::Text(text.into()), true)
        }
        Some(WsFrameType::Close) => (Message::Close(None), false),
        Some(WsFrameType::Binary) | None => (Message::Binary(payload), true),
    };
    local_tx
        .send(frame)
        .await
        .map_err(|e| TunnelError::stream(id, format!("local send failed: {e}")))?;
    Ok(keep_open)
}

async fn send_to_relay(
    link: &StreamLink,
    data: Bytes,
    frame_type: WsFrameType,
) -> Result<(), TunnelError> {
    let mut msg = WebStreamMsg::new(link.id());
    msg.ws_frame_type = Some(frame_type);
    let compress = should_compress_frame(data.len());
    attach_payload(&mut msg, data, compress);
    link.send(msg).await
}
