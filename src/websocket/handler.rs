use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use uuid::Uuid;

use crate::codec::envelope::CONNECTION_ESTABLISHED;
use crate::codec::{encode_response, ResponseEnvelope};
use crate::session::{SessionHandle, SessionRegistry};
use crate::websocket::router::RequestRouter;

pub const WS_PATH: &str = "/ws/chart";

/// Drives one downstream connection from handshake to eviction.
pub struct WebSocketHandler {
    registry: SessionRegistry,
    router: RequestRouter,
    peer_addr: String,
    // A session whose send does not complete within this bound is evicted.
    send_timeout: Duration,
}

impl WebSocketHandler {
    pub fn new(
        registry: SessionRegistry,
        router: RequestRouter,
        peer_addr: String,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            router,
            peer_addr,
            send_timeout,
        }
    }

    pub async fn handle_connection(self, stream: TcpStream) {
        let ws_stream = match accept_hdr_async(stream, |req: &Request, response: Response| {
            self.check_path(req, response)
        })
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                error!("WebSocket handshake failed for {}: {:?}", self.peer_addr, e);
                return;
            }
        };

        self.handle_websocket_connection(ws_stream).await;
    }

    fn check_path(&self, req: &Request, response: Response) -> Result<Response, ErrorResponse> {
        let path = req.uri().path();
        if path == WS_PATH {
            return Ok(response);
        }

        warn!("Rejecting WebSocket upgrade for unknown path {} from {}", path, self.peer_addr);
        let mut rejection = ErrorResponse::new(Some(format!("No WebSocket endpoint at {}", path)));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    }

    async fn handle_websocket_connection(&self, ws_stream: WebSocketStream<TcpStream>) {
        let (write, read) = ws_stream.split();

        let (handle, outbound) = SessionHandle::new(self.peer_addr.clone());
        let session_id = handle.id();
        self.registry.add(handle.clone());

        info!("WebSocket connection established - Session: {} from {}", session_id, self.peer_addr);

        let welcome = ResponseEnvelope::success(
            CONNECTION_ESTABLISHED,
            None,
            Value::String("WebSocket connection established successfully".to_string()),
        );
        if let Err(e) = handle.send(encode_response(&welcome)) {
            warn!("Failed to queue welcome for session {}: {}", session_id, e);
        }

        let (close_tx, close_rx) = mpsc::channel::<()>(1);

        let mut write_task = self.spawn_write_task(write, outbound, close_rx, session_id);
        let mut read_task = self.spawn_read_task(read, close_tx, handle);

        tokio::select! {
            _ = &mut write_task => {
                info!("Write task completed for session {}", session_id);
            }
            _ = &mut read_task => {
                info!("Read task completed for session {}", session_id);
            }
        }

        write_task.abort();
        read_task.abort();
        if let Some(handle) = self.registry.remove(session_id) {
            info!(
                "WebSocket connection closed - Session: {} from {} after {:?}",
                session_id,
                self.peer_addr,
                handle.connected_at().elapsed()
            );
        }
    }

    fn spawn_write_task(
        &self,
        mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut outbound: mpsc::UnboundedReceiver<String>,
        mut close_rx: mpsc::Receiver<()>,
        session_id: Uuid,
    ) -> tokio::task::JoinHandle<()> {
        let send_timeout = self.send_timeout;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outbound.recv() => match message {
                        Some(message) => {
                            match timeout(send_timeout, write.send(Message::Text(message))).await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    error!("Error sending message to session {}: {:?}", session_id, e);
                                    break;
                                }
                                Err(_) => {
                                    warn!(
                                        "Send to session {} did not complete within {:?}, evicting",
                                        session_id, send_timeout
                                    );
                                    break;
                                }
                            }
                        }
                        None => break,
                    },
                    _ = close_rx.recv() => {
                        debug!("Received close signal for session {}", session_id);
                        break;
                    }
                }
            }
        })
    }

    fn spawn_read_task(
        &self,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        close_tx: mpsc::Sender<()>,
        handle: SessionHandle,
    ) -> tokio::task::JoinHandle<()> {
        let router = self.router.clone();

        tokio::spawn(async move {
            let session_id = handle.id();

            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let response = router.handle_text(session_id, &text);
                        if let Err(e) = handle.send(encode_response(&response)) {
                            warn!("Failed to queue response for session {}: {}", session_id, e);
                            break;
                        }
                    }
                    Ok(Message::Close(close_frame)) => {
                        info!("Received close frame from session {}: {:?}", session_id, close_frame);
                        break;
                    }
                    Ok(Message::Binary(data)) => {
                        debug!("Ignoring {} byte binary message from session {}", data.len(), session_id);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error reading message from session {}: {:?}", session_id, e);
                        break;
                    }
                }
            }

            let _ = close_tx.send(()).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InMemoryBarStore, InMemoryStockDirectory};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{client_async, connect_async};

    const SEND_TIMEOUT: Duration = Duration::from_millis(300);

    async fn serve_one(registry: SessionRegistry) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = RequestRouter::new(
            Arc::new(InMemoryStockDirectory::default()),
            Arc::new(InMemoryBarStore::default()),
            registry.clone(),
        );

        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            WebSocketHandler::new(registry, router, peer.to_string(), SEND_TIMEOUT)
                .handle_connection(stream)
                .await;
        });
        addr.to_string()
    }

    async fn next_json(
        ws: &mut WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) -> Value {
        loop {
            let message = timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let registry = SessionRegistry::new();
        let addr = serve_one(registry.clone()).await;

        let (mut ws, _) = connect_async(format!("ws://{}{}", addr, WS_PATH)).await.unwrap();

        let welcome = next_json(&mut ws).await;
        assert_eq!(welcome["type"], CONNECTION_ESTABLISHED);
        assert_eq!(welcome["status"], "SUCCESS");
        assert_eq!(registry.count(), 1);

        ws.send(Message::Text(r#"{"type":"PING","requestId":"r1"}"#.to_string()))
            .await
            .unwrap();
        let pong = next_json(&mut ws).await;
        assert_eq!(pong["type"], "PONG");
        assert_eq!(pong["requestId"], "r1");

        assert_eq!(registry.broadcast(r#"{"type":"REALTIME_TICK"}"#), 1);
        let pushed = next_json(&mut ws).await;
        assert_eq!(pushed["type"], "REALTIME_TICK");

        ws.close(None).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while registry.count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected() {
        let registry = SessionRegistry::new();
        let addr = serve_one(registry.clone()).await;

        let result = connect_async(format!("ws://{}/ws/other", addr)).await;
        assert!(result.is_err());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_reader_is_evicted() {
        let registry = SessionRegistry::new();
        let addr = serve_one(registry.clone()).await;

        // Complete the handshake, then never read again.
        let stream = TcpStream::connect(&addr).await.unwrap();
        let (_ws, _) = client_async(format!("ws://{}{}", addr, WS_PATH), stream).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while registry.count() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let payload = "x".repeat(1024 * 1024);
        for _ in 0..64 {
            registry.broadcast(&payload);
        }

        timeout(Duration::from_secs(10), async {
            while registry.count() != 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("stalled session was not evicted");
    }
}
