//! WebSocket transport to the realtime gateway
//!
//! Owns the connection and the two tasks that pump it: a reader task that
//! turns inbound frames into [`TransportEvent`]s on an mpsc channel, and a
//! single writer task that drains the outbound envelope queue. Every send
//! in the process goes through that one queue, so outbound envelopes are
//! serialized and delivered in submission order no matter which task
//! produced them.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

/// Events delivered by the connection
#[derive(Debug)]
pub enum TransportEvent {
    /// Upgrade completed with the given HTTP status (101 on success)
    Connected { status: u16 },
    /// One inbound text envelope
    Text(String),
    /// The connection is gone; no further events follow
    Closed,
}

/// Items accepted by the writer task
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Handle to an established gateway connection
pub struct WsTransport {
    outbound: mpsc::Sender<Outbound>,
}

impl WsTransport {
    /// Connect and authenticate, returning the handle and the inbound
    /// event stream. The first event is always `Connected`.
    pub async fn connect(
        url: &str,
        token: &str,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let status = response.status().as_u16();
        tracing::debug!("WebSocket upgrade status {status}");

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Outbound>(32);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(64);

        // Writer: the only task that touches the sink.
        tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Text(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            tracing::warn!("WebSocket send failed: {e}");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader: inbound frames to events.
        let _ = event_tx.send(TransportEvent::Connected { status }).await;
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if event_tx.send(TransportEvent::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    // Ping/pong are handled by the protocol layer.
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("WebSocket read failed: {e}");
                        break;
                    }
                }
            }
            let _ = event_tx.send(TransportEvent::Closed).await;
        });

        Ok((Self { outbound }, event_rx))
    }

    /// Queue one text envelope for sending
    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Text(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Clone of the outbound queue, for workers that send directly
    pub fn sender(&self) -> mpsc::Sender<Outbound> {
        self.outbound.clone()
    }

    /// Send a close frame and stop the writer. Safe to call repeatedly.
    pub async fn close(&self) {
        let _ = self.outbound.send(Outbound::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_echo_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => {
                        if text == "bye" {
                            let _ = ws.close(None).await;
                            break;
                        }
                        ws.send(Message::Text(format!("echo:{text}"))).await.unwrap();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_connect_reports_upgrade_status() {
        let (addr, server) = spawn_echo_server().await;
        let (transport, mut events) =
            WsTransport::connect(&format!("ws://{addr}"), "test-token")
                .await
                .unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Connected { status } => assert_eq!(status, 101),
            other => panic!("expected Connected, got {other:?}"),
        }

        transport.send_text("bye".to_string()).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_and_receive_in_order() {
        let (addr, server) = spawn_echo_server().await;
        let (transport, mut events) =
            WsTransport::connect(&format!("ws://{addr}"), "test-token")
                .await
                .unwrap();

        // Skip the Connected event.
        events.recv().await.unwrap();

        transport.send_text("one".to_string()).await.unwrap();
        transport.send_text("two".to_string()).await.unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Text(text) => assert_eq!(text, "echo:one"),
            other => panic!("expected Text, got {other:?}"),
        }
        match events.recv().await.unwrap() {
            TransportEvent::Text(text) => assert_eq!(text, "echo:two"),
            other => panic!("expected Text, got {other:?}"),
        }

        transport.send_text("bye".to_string()).await.unwrap();
        match events.recv().await.unwrap() {
            TransportEvent::Closed => {}
            other => panic!("expected Closed, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing listens here.
        let result = WsTransport::connect("ws://127.0.0.1:1/", "token").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
