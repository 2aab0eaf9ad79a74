//! WebSocket relay server: listener, handshake, graceful shutdown.
//!
//! Binds a TCP listener and upgrades each accepted socket to a WebSocket.
//! Every connection gets a generated peer id, a bounded outbound queue
//! registered with the Hub, and an inbound/outbound loop pair
//! ([`crate::relay::peer`]).
//!
//! Origin checking is caller-configurable and permissive by default
//! (`allowed_origin: None` accepts any origin). Deployments reachable from
//! the public internet should set an expected origin.

// Rust guideline compliant 2026-02

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;

use crate::config::Config;
use crate::hub::HubHandle;
use crate::relay::peer;

/// Room-scoped broadcast relay over WebSocket.
///
/// Owns the accept loop and the per-connection task handles; membership
/// and dispatch live in the [`Hub`](crate::hub::Hub).
pub struct RelayServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    hub: HubHandle,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl RelayServer {
    /// Bind the listener and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured address cannot be bound.
    pub async fn bind(config: &Config, hub: HubHandle) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {}", config.bind_addr))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read relay listener address")?;

        log::info!("[Relay] listening on {local_addr}");

        let conn_tasks = Arc::new(Mutex::new(Vec::new()));
        let accept_handle = tokio::spawn(Self::accept_loop(
            listener,
            hub.clone(),
            config.allowed_origin.clone(),
            config.outbound_queue,
            Arc::clone(&conn_tasks),
        ));

        Ok(Self {
            local_addr,
            accept_handle,
            conn_tasks,
            hub,
        })
    }

    /// Address the listener is bound to (useful with a `:0` bind).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop — runs as a tokio task until aborted by shutdown.
    async fn accept_loop(
        listener: TcpListener,
        hub: HubHandle,
        allowed_origin: Option<String>,
        queue_capacity: usize,
        conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let handle = tokio::spawn(Self::handle_connection(
                        stream,
                        addr,
                        hub.clone(),
                        allowed_origin.clone(),
                        queue_capacity,
                    ));
                    if let Ok(mut tasks) = conn_tasks.lock() {
                        // Completed handles are cheap to keep; they are
                        // reaped at shutdown.
                        tasks.push(handle);
                    }
                }
                Err(e) => {
                    log::error!("[Relay] accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Upgrade one socket and run its pump loops to completion.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: HubHandle,
        allowed_origin: Option<String>,
        queue_capacity: usize,
    ) {
        let ws = match accept_websocket(stream, allowed_origin).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("[Relay] handshake with {addr} failed: {e:#}");
                return;
            }
        };

        let peer_id = generate_peer_id();
        log::info!("[Relay] peer connected: {peer_id} ({addr})");

        let (frame_tx, frame_rx) = mpsc::channel(queue_capacity);
        hub.connect(&peer_id, frame_tx);

        let (sink, stream) = ws.split();
        let write_handle = tokio::spawn(peer::write_loop(peer_id.clone(), sink, frame_rx));

        peer::read_loop(peer_id.clone(), stream, hub).await;

        // The inbound loop has unregistered the peer, closing its queue;
        // the outbound loop drains what is left and exits.
        let _ = write_handle.await;
        log::info!("[Relay] peer disconnected: {peer_id}");
    }

    /// Stop accepting, shut the Hub down, and wait up to `grace` for the
    /// connection tasks to drain before aborting the stragglers.
    ///
    /// In-flight jobs on agent processes are unaffected; status updates
    /// arriving after the transport is gone are dropped (best-effort).
    pub async fn shutdown(self, grace: Duration) {
        log::info!("[Relay] shutting down (grace {grace:?})");
        self.accept_handle.abort();
        self.hub.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = match self.conn_tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let deadline = tokio::time::Instant::now() + grace;
        for mut task in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                log::warn!("[Relay] connection task missed the drain deadline, aborting");
                task.abort();
            }
        }

        log::info!("[Relay] shutdown complete");
    }
}

/// Perform the WebSocket upgrade, enforcing the origin policy when one is
/// configured.
async fn accept_websocket(
    stream: TcpStream,
    allowed_origin: Option<String>,
) -> Result<WebSocketStream<TcpStream>> {
    let callback = move |request: &Request, response: Response| {
        if let Some(expected) = &allowed_origin {
            let origin = request
                .headers()
                .get("origin")
                .and_then(|value| value.to_str().ok());
            if origin != Some(expected.as_str()) {
                log::warn!("[Relay] rejected connection from origin {origin:?}");
                let mut reject = ErrorResponse::new(Some("origin not allowed".to_string()));
                *reject.status_mut() = StatusCode::FORBIDDEN;
                return Err(reject);
            }
        }
        Ok(response)
    };

    tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .context("WebSocket handshake failed")
}

/// Generate a unique peer id using a monotonic counter + random suffix.
fn generate_peer_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("peer:{seq:x}{rand:04x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::protocol::Envelope;
    use futures_util::SinkExt;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;

    fn test_config() -> Config {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Config::default()
        }
    }

    async fn start_server(config: Config) -> (RelayServer, HubHandle, String) {
        let (hub, _task) = Hub::spawn();
        let server = RelayServer::bind(&config, hub.clone())
            .await
            .expect("failed to bind test relay");
        let url = format!("ws://{}/ws", server.local_addr());
        (server, hub, url)
    }

    async fn ws_connect(
        url: &str,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("test client connect failed");
        ws
    }

    async fn next_text(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("read failed");
            if let Message::Text(text) = msg {
                return text;
            }
        }
    }

    /// Poll a room's size until the expectation holds (membership updates
    /// are applied asynchronously after a transport event).
    async fn wait_for_room_size(hub: &HubHandle, room: &str, expected: Option<usize>) {
        for _ in 0..50 {
            if hub.room_size(room).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "room {room} never reached size {expected:?}, is {:?}",
            hub.room_size(room).await
        );
    }

    #[tokio::test]
    async fn test_join_and_forward_between_peers() {
        let (_server, hub, url) = start_server(test_config()).await;

        let mut a = ws_connect(&url).await;
        let mut b = ws_connect(&url).await;
        a.send(Message::Text(Envelope::new("join", "r1").encode()))
            .await
            .unwrap();
        b.send(Message::Text(Envelope::new("join", "r1").encode()))
            .await
            .unwrap();
        wait_for_room_size(&hub, "r1", Some(2)).await;

        let frame = r#"{"type":"chat","roomId":"r1","payload":"hi"}"#;
        a.send(Message::Text(frame.to_string())).await.unwrap();

        // B receives the original bytes verbatim
        assert_eq!(next_text(&mut b).await, frame);
    }

    #[tokio::test]
    async fn test_join_frame_is_forwarded_to_existing_members() {
        let (_server, hub, url) = start_server(test_config()).await;

        let mut a = ws_connect(&url).await;
        a.send(Message::Text(Envelope::new("join", "r1").encode()))
            .await
            .unwrap();
        wait_for_room_size(&hub, "r1", Some(1)).await;

        let mut b = ws_connect(&url).await;
        let join = Envelope::new("join", "r1").encode();
        b.send(Message::Text(join.clone())).await.unwrap();

        assert_eq!(next_text(&mut a).await, join);
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_kill_connection() {
        let (_server, hub, url) = start_server(test_config()).await;

        let mut a = ws_connect(&url).await;
        let mut b = ws_connect(&url).await;
        a.send(Message::Text(Envelope::new("join", "r1").encode()))
            .await
            .unwrap();
        b.send(Message::Text(Envelope::new("join", "r1").encode()))
            .await
            .unwrap();
        wait_for_room_size(&hub, "r1", Some(2)).await;

        a.send(Message::Text("this is not json".to_string()))
            .await
            .unwrap();
        let frame = r#"{"type":"chat","roomId":"r1","payload":"still alive"}"#;
        a.send(Message::Text(frame.to_string())).await.unwrap();

        assert_eq!(next_text(&mut b).await, frame);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_membership() {
        let (_server, hub, url) = start_server(test_config()).await;

        let mut a = ws_connect(&url).await;
        a.send(Message::Text(Envelope::new("join", "r1").encode()))
            .await
            .unwrap();
        wait_for_room_size(&hub, "r1", Some(1)).await;

        drop(a);
        wait_for_room_size(&hub, "r1", None).await;
    }

    #[tokio::test]
    async fn test_origin_policy_rejects_mismatched_origin() {
        let config = Config {
            allowed_origin: Some("https://app.example".to_string()),
            ..test_config()
        };
        let (_server, _hub, url) = start_server(config).await;

        let mut request = url.as_str().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("origin", "https://evil.example".parse().unwrap());
        let result = tokio_tungstenite::connect_async(request).await;
        assert!(result.is_err(), "mismatched origin must be rejected");
    }

    #[tokio::test]
    async fn test_origin_policy_accepts_configured_origin() {
        let config = Config {
            allowed_origin: Some("https://app.example".to_string()),
            ..test_config()
        };
        let (_server, _hub, url) = start_server(config).await;

        let mut request = url.as_str().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("origin", "https://app.example".parse().unwrap());
        let result = tokio_tungstenite::connect_async(request).await;
        assert!(result.is_ok(), "configured origin must be accepted");
    }

    #[tokio::test]
    async fn test_default_origin_policy_is_permissive() {
        let (_server, _hub, url) = start_server(test_config()).await;

        let mut request = url.as_str().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("origin", "https://anywhere.example".parse().unwrap());
        assert!(tokio_tungstenite::connect_async(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (server, hub, url) = start_server(test_config()).await;

        let mut a = ws_connect(&url).await;
        a.send(Message::Text(Envelope::new("join", "r1").encode()))
            .await
            .unwrap();
        wait_for_room_size(&hub, "r1", Some(1)).await;

        server.shutdown(Duration::from_secs(2)).await;

        // The client observes the close within the grace period
        let msg = tokio::time::timeout(Duration::from_secs(5), a.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
            other => panic!("expected close, got {other:?}"),
        }
    }
}
