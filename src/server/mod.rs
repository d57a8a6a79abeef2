//! WebSocket adapter between the chat UI and the [`RequestCoordinator`].
//!
//! One task per connection; each incoming frame is handled in its own task
//! so a slow model call does not hold up other requests on the same socket.
//! Replies are funnelled through a channel to a single writer task.

pub mod messages;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;

use crate::coordinator::{ChatRequest, RequestCoordinator};
use crate::provider::Supervisor;
pub use messages::{ClientMessage, ServerMessage};

/// Replies queued per connection before handlers start waiting.
const OUTBOUND_BUFFER: usize = 32;

/// What every connection needs to answer frames.
pub struct BridgeState {
    pub coordinator: RequestCoordinator,
    pub supervisor: Supervisor,
}

/// Accept connections until `shutdown` resolves.
///
/// Connections still open at shutdown are dropped along with their
/// in-flight requests.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<BridgeState>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "chat bridge listening");

    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(stream, peer, Arc::clone(&state)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    tracing::info!(open = connections.len(), "chat bridge shutting down");
    connections.shutdown().await;
    Ok(())
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<BridgeState>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    tracing::info!(%peer, "client connected");

    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                tracing::debug!(%peer, error = %e, "websocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut inflight = JoinSet::new();
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let state = Arc::clone(&state);
                let out_tx = out_tx.clone();
                inflight.spawn(async move {
                    let reply = dispatch(&state, &text).await;
                    send_reply(&out_tx, &reply).await;
                });
            }
            Ok(Message::Binary(_)) => {
                let reply = ServerMessage::invalid_frame("binary frames are not supported");
                send_reply(&out_tx, &reply).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(%peer, error = %e, "websocket read failed");
                break;
            }
        }

        while let Some(done) = inflight.try_join_next() {
            if let Err(e) = done {
                tracing::error!(%peer, error = %e, "frame handler did not complete");
            }
        }
    }

    // The peer is gone; its pending requests have nobody to answer to.
    inflight.shutdown().await;
    drop(out_tx);
    let _ = writer.await;
    tracing::info!(%peer, "client disconnected");
}

/// Turn one text frame into its reply.
pub async fn dispatch(state: &BridgeState, text: &str) -> ServerMessage {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => return ServerMessage::invalid_frame(format!("unrecognized message: {e}")),
    };

    match message {
        ClientMessage::ChatMessage { id, content } => {
            match state.coordinator.handle(ChatRequest { content }).await {
                Ok(response) => ServerMessage::ChatResponse {
                    id,
                    content: response.content,
                },
                Err(e) => ServerMessage::from_error(id, &e),
            }
        }
        ClientMessage::ProvidersStatus { id } => ServerMessage::ProvidersStatus {
            id,
            providers: state.supervisor.list_handles(),
        },
    }
}

async fn send_reply(out_tx: &mpsc::Sender<Message>, reply: &ServerMessage) {
    match serde_json::to_string(reply) {
        Ok(json) => {
            // A closed channel means the connection is already going away.
            let _ = out_tx.send(Message::Text(json)).await;
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize reply"),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{ModelBackend, ModelError};
    use crate::provider::CapabilityAggregator;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Answers after a delay taken from the message, e.g. `"slow:300"`.
    struct EchoModel;

    #[async_trait]
    impl ModelBackend for EchoModel {
        async fn infer(&self, _prompt: &str, user_message: &str) -> Result<String, ModelError> {
            if let Some(ms) = user_message.strip_prefix("slow:") {
                let ms: u64 = ms.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Ok(format!("echo: {user_message}"))
        }
    }

    async fn start_server() -> (String, oneshot::Sender<()>) {
        let supervisor = Supervisor::new(Duration::from_millis(300));
        let aggregator = CapabilityAggregator::new(supervisor.clone(), Duration::from_millis(300));
        let state = Arc::new(BridgeState {
            coordinator: RequestCoordinator::new(aggregator, Arc::new(EchoModel)),
            supervisor,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(serve(listener, state, async move {
            let _ = stop_rx.await;
        }));
        (format!("ws://{addr}"), stop_tx)
    }

    async fn next_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for reply")
                .expect("connection closed")
                .expect("read error");
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_chat_round_trip() {
        let (url, _stop) = start_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let frame = serde_json::json!({"type": "chat_message", "content": "hello"});
        ws.send(Message::Text(frame.to_string())).await.unwrap();

        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "chat_response");
        assert_eq!(reply["content"], "echo: hello");
    }

    #[tokio::test]
    async fn test_empty_message_gets_chat_error() {
        let (url, _stop) = start_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let frame = serde_json::json!({"type": "chat_message", "id": "a1", "content": "  "});
        ws.send(Message::Text(frame.to_string())).await.unwrap();

        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "chat_error");
        assert_eq!(reply["id"], "a1");
        assert_eq!(reply["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn test_garbage_frame_keeps_connection_open() {
        let (url, _stop) = start_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        ws.send(Message::Text("not json".into())).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "chat_error");
        assert_eq!(reply["kind"], "invalid_request");

        let frame = serde_json::json!({"type": "providers_status"});
        ws.send(Message::Text(frame.to_string())).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "providers_status");
        assert_eq!(reply["providers"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_requests_on_one_connection_do_not_serialize() {
        let (url, _stop) = start_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let slow = serde_json::json!({"type": "chat_message", "id": "slow", "content": "slow:800"});
        let fast = serde_json::json!({"type": "chat_message", "id": "fast", "content": "quick"});
        ws.send(Message::Text(slow.to_string())).await.unwrap();
        ws.send(Message::Text(fast.to_string())).await.unwrap();

        let first = next_json(&mut ws).await;
        let second = next_json(&mut ws).await;
        assert_eq!(first["id"], "fast");
        assert_eq!(second["id"], "slow");
        assert_eq!(second["content"], "echo: slow:800");
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (url, stop) = start_server().await;
        stop.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(tokio_tungstenite::connect_async(&url).await.is_err());
    }
}
