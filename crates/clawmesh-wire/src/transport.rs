//! WebSocket framing glue.
//!
//! Frames are JSON text messages. During the handshake both directions
//! run on the unsplit stream; once a session is registered the stream is
//! split, reads stay with the connection task, and all writes go through
//! a single writer task fed by the session's channel, so no two tasks
//! ever interleave writes on one socket.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use clawmesh_types::wire::{decode_frame, encode_frame};
use clawmesh_types::{ErrorCode, MeshError, MeshResult, WireFrame};

use crate::session::Outbound;

/// Send one frame on an unsplit stream (handshake phase).
pub async fn send_frame<S>(ws: &mut WebSocketStream<S>, frame: &WireFrame) -> MeshResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = encode_frame(frame)
        .map_err(|e| MeshError::new(ErrorCode::SendFailed, format!("encode failed: {e}")))?;
    ws.send(Message::Text(text))
        .await
        .map_err(|e| MeshError::new(ErrorCode::SendFailed, format!("send failed: {e}")))
}

/// Receive the next frame on an unsplit stream (handshake phase).
/// `None` means the connection closed.
pub async fn recv_frame<S>(ws: &mut WebSocketStream<S>) -> Option<MeshResult<WireFrame>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = ws.next().await?;
        match message {
            Ok(Message::Text(text)) => {
                return Some(decode_frame(&text).map_err(|e| {
                    MeshError::invalid_params(format!("malformed frame: {e}"))
                }));
            }
            Ok(Message::Close(_)) => return None,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {
                continue;
            }
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                return None;
            }
        }
    }
}

/// Receive with a deadline; used while a handshake is in flight so a
/// silent peer cannot park an accepted connection forever.
pub async fn recv_frame_timeout<S>(
    ws: &mut WebSocketStream<S>,
    deadline: Duration,
) -> MeshResult<WireFrame>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(deadline, recv_frame(ws)).await {
        Ok(Some(result)) => result,
        Ok(None) => Err(MeshError::new(
            ErrorCode::PeerDisconnected,
            "connection closed during handshake",
        )),
        Err(_) => Err(MeshError::new(
            ErrorCode::Timeout,
            "handshake timed out",
        )),
    }
}

/// Read the next frame from the read half of a split stream.
/// `None` means the connection closed.
pub async fn next_frame<S>(stream: &mut SplitStream<WebSocketStream<S>>) -> Option<WireFrame>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = stream.next().await?;
        match message {
            Ok(Message::Text(text)) => match decode_frame(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    debug!(error = %e, "dropping malformed frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {
                continue;
            }
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                return None;
            }
        }
    }
}

/// Spawn the single writer task for a session's socket. Consumes the
/// session's outbound channel until shutdown, a send error, or every
/// sender dropping.
pub fn spawn_writer<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    let text = match encode_frame(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            debug!(error = %e, "dropping unencodable frame");
                            continue;
                        }
                    };
                    trace!(bytes = text.len(), "writing frame");
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(error = %e, "writer send failed, closing");
                        break;
                    }
                }
                Outbound::Shutdown => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn ws_pair() -> (
        WebSocketStream<TcpStream>,
        WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        (accept.await.unwrap(), client)
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_socket() {
        let (mut server, mut client) = ws_pair().await;

        send_frame(&mut client, &WireFrame::request("mesh.status", serde_json::json!({})))
            .await
            .unwrap();
        let frame = recv_frame(&mut server).await.unwrap().unwrap();
        match frame {
            WireFrame::Req { method, .. } => assert_eq!(method, "mesh.status"),
            other => panic!("expected req, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_writer_task_delivers_and_closes() {
        let (server, mut client) = ws_pair().await;
        let (sink, _read) = server.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(sink, rx);

        tx.send(Outbound::Frame(WireFrame::event("context.frame", serde_json::json!({"n": 1}))))
            .unwrap();
        let frame = recv_frame(&mut client).await.unwrap().unwrap();
        assert!(matches!(frame, WireFrame::Event { .. }));

        tx.send(Outbound::Shutdown).unwrap();
        writer.await.unwrap();
        assert!(recv_frame(&mut client).await.is_none());
    }

    #[tokio::test]
    async fn test_handshake_recv_timeout() {
        let (mut server, _client) = ws_pair().await;
        let err = recv_frame_timeout(&mut server, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }
}
