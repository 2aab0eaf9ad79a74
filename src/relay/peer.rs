//! Per-connection pump loops (relay-side).
//!
//! Each accepted connection runs two independent tasks over the split
//! WebSocket:
//!
//! - the **inbound loop** decodes envelopes and feeds the Hub
//!   (`join` → register, every decoded frame → broadcast of the original
//!   bytes), and
//! - the **outbound loop** drains the peer's bounded queue to the socket.
//!
//! Single-writer rule: only the outbound loop writes to the transport.
//! Every producer — the Hub's broadcast dispatch included — goes through
//! the queue, so frames are never interleaved mid-write.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::Receiver;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::hub::HubHandle;
use crate::protocol::{Envelope, KIND_JOIN};

/// Inbound loop: read frames until the transport closes or errors, then
/// unregister exactly once.
///
/// Malformed envelopes are dropped (logged) without terminating the
/// connection — a bad message is fatal only to itself.
pub(crate) async fn read_loop(
    peer_id: String,
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    hub: HubHandle,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_frame(&peer_id, &text, &hub),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => handle_frame(&peer_id, &text, &hub),
                Err(_) => {
                    log::debug!("[Peer] {peer_id}: dropping non-UTF-8 binary frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong are protocol-level, nothing to relay
            Err(e) => {
                log::info!("[Peer] {peer_id}: read error: {e}");
                break;
            }
        }
    }

    hub.unregister(&peer_id);
    log::debug!("[Peer] {peer_id}: inbound loop exited");
}

/// Decode one frame and dispatch it to the Hub.
fn handle_frame(peer_id: &str, text: &str, hub: &HubHandle) {
    let envelope = match Envelope::decode(text.as_bytes()) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::debug!("[Peer] {peer_id}: dropping malformed frame: {e:#}");
            return;
        }
    };

    // Explicit-join model: room membership changes only on `join` frames,
    // never on other traffic.
    if envelope.kind == KIND_JOIN {
        hub.register(peer_id, &envelope.room_id);
    }

    // Forward the original bytes, not a re-encoding, so recipients see the
    // frame verbatim.
    hub.broadcast(&envelope.room_id, peer_id, text.to_string());
}

/// Outbound loop: drain the bounded queue to the socket in order.
///
/// Exits when the queue closes (unregister or backpressure eviction) or on
/// a write error, and closes the transport on the way out.
pub(crate) async fn write_loop(
    peer_id: String,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut frame_rx: Receiver<String>,
) {
    while let Some(frame) = frame_rx.recv().await {
        if let Err(e) = sink.send(Message::Text(frame)).await {
            log::info!("[Peer] {peer_id}: write error: {e}");
            break;
        }
    }

    let _ = sink.close().await;
    log::debug!("[Peer] {peer_id}: outbound loop exited");
}
