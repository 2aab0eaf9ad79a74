//! Room registry and broadcast dispatch.
//!
//! The Hub is the single serialization point for membership state. All
//! mutation and broadcast dispatch run on one actor task fed by an
//! unbounded command channel, so `register`/`unregister`/`broadcast`
//! execute in a total order — a broadcast can never observe a peer that is
//! halfway through being unregistered.
//!
//! # Backpressure
//!
//! Delivery to a peer is non-blocking (`try_send` into its bounded
//! outbound queue). A peer whose queue is full is treated as unresponsive:
//! it is evicted from its room and its queue is closed, which terminates
//! its write loop. A slow consumer is disconnected rather than allowed to
//! stall the broadcaster or the other recipients.
//!
//! # Ownership
//!
//! The Hub holds only the sender half of each peer's outbound queue. The
//! peer tasks own the transport and the receiver; dropping the sender here
//! is what lets a write loop drain its remaining frames and exit.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Sender, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Identifier for one connected peer.
pub type PeerId = String;

/// Hub-side handle to a peer: just the sender half of its outbound queue.
#[derive(Debug)]
struct PeerEntry {
    frame_tx: Sender<String>,
}

/// Command processed by the Hub actor task.
#[derive(Debug)]
enum HubCommand {
    /// Admit an accepted connection (pre-join).
    Connect { peer_id: PeerId, frame_tx: Sender<String> },
    /// Join a room, creating it if absent; moves the peer out of any
    /// previous room first.
    Register { peer_id: PeerId, room: String },
    /// Leave the current room and close the peer's outbound queue.
    Unregister { peer_id: PeerId },
    /// Deliver a frame to every member of `room` except `sender`.
    Broadcast { room: String, sender: PeerId, frame: String },
    /// Member count query (None if the room does not exist).
    RoomSize { room: String, reply: oneshot::Sender<Option<usize>> },
    /// Drop all peers and stop the actor.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable handle to the Hub actor.
///
/// All methods are fire-and-forget except the queries; a send to a Hub
/// that already shut down is silently dropped.
#[derive(Debug, Clone)]
pub struct HubHandle {
    cmd_tx: UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Admit a newly accepted connection, handing its outbound sender to
    /// the registry.
    pub fn connect(&self, peer_id: &str, frame_tx: Sender<String>) {
        self.send(HubCommand::Connect {
            peer_id: peer_id.to_string(),
            frame_tx,
        });
    }

    /// Add a peer to a room. Idempotent for the same room; a peer already
    /// in a different room is moved (the old room is cleaned up if it
    /// becomes empty).
    pub fn register(&self, peer_id: &str, room: &str) {
        self.send(HubCommand::Register {
            peer_id: peer_id.to_string(),
            room: room.to_string(),
        });
    }

    /// Remove a peer from its room and close its outbound queue. Safe to
    /// call multiple times; subsequent calls are no-ops.
    pub fn unregister(&self, peer_id: &str) {
        self.send(HubCommand::Unregister {
            peer_id: peer_id.to_string(),
        });
    }

    /// Deliver `frame` to every member of `room` except `sender`.
    /// Unknown room is a no-op.
    pub fn broadcast(&self, room: &str, sender: &str, frame: String) {
        self.send(HubCommand::Broadcast {
            room: room.to_string(),
            sender: sender.to_string(),
            frame,
        });
    }

    /// Member count of `room`, or `None` if no such room exists.
    pub async fn room_size(&self, room: &str) -> Option<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::RoomSize {
            room: room.to_string(),
            reply: reply_tx,
        });
        reply_rx.await.ok().flatten()
    }

    /// Drop all peer handles (closing their queues) and stop the actor.
    /// Resolves once the registry is cleared.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::Shutdown { reply: reply_tx });
        let _ = reply_rx.await;
    }

    fn send(&self, cmd: HubCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            log::debug!("[Hub] command dropped, hub already stopped");
        }
    }
}

/// Room registry state, owned exclusively by the actor task.
pub struct Hub {
    peers: HashMap<PeerId, PeerEntry>,
    rooms: HashMap<String, HashSet<PeerId>>,
    room_of: HashMap<PeerId, String>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("peers", &self.peers.len())
            .field("rooms", &self.rooms.len())
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Spawn the Hub actor task and return a handle to it.
    pub fn spawn() -> (HubHandle, JoinHandle<()>) {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let mut hub = Self {
            peers: HashMap::new(),
            rooms: HashMap::new(),
            room_of: HashMap::new(),
        };

        let task = tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if hub.handle(cmd) {
                    break;
                }
            }
            log::info!("[Hub] actor stopped");
        });

        (HubHandle { cmd_tx }, task)
    }

    /// Process one command. Returns `true` on shutdown.
    fn handle(&mut self, cmd: HubCommand) -> bool {
        match cmd {
            HubCommand::Connect { peer_id, frame_tx } => {
                log::debug!("[Hub] peer connected: {peer_id}");
                self.peers.insert(peer_id, PeerEntry { frame_tx });
            }
            HubCommand::Register { peer_id, room } => self.register(peer_id, room),
            HubCommand::Unregister { peer_id } => self.unregister(&peer_id),
            HubCommand::Broadcast { room, sender, frame } => {
                self.broadcast(&room, &sender, &frame);
            }
            HubCommand::RoomSize { room, reply } => {
                let _ = reply.send(self.rooms.get(&room).map(|members| members.len()));
            }
            HubCommand::Shutdown { reply } => {
                log::info!(
                    "[Hub] shutting down ({} peers, {} rooms)",
                    self.peers.len(),
                    self.rooms.len()
                );
                self.peers.clear();
                self.rooms.clear();
                self.room_of.clear();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn register(&mut self, peer_id: PeerId, room: String) {
        if !self.peers.contains_key(&peer_id) {
            // Evicted or already disconnected; membership would leak.
            log::warn!("[Hub] register for unknown peer {peer_id} ignored");
            return;
        }

        if let Some(prev) = self.room_of.get(&peer_id) {
            if *prev == room {
                return;
            }
            let prev = prev.clone();
            self.leave_room(&peer_id, &prev);
        }

        log::info!("[Hub] peer {peer_id} joined room {room}");
        self.rooms.entry(room.clone()).or_default().insert(peer_id.clone());
        self.room_of.insert(peer_id, room);
    }

    fn unregister(&mut self, peer_id: &str) {
        if let Some(room) = self.room_of.remove(peer_id) {
            self.leave_room(peer_id, &room);
        }
        if self.peers.remove(peer_id).is_some() {
            // Dropping the sender closes the queue; the write loop drains
            // what is already enqueued and exits.
            log::info!("[Hub] peer {peer_id} unregistered");
        }
    }

    fn broadcast(&mut self, room: &str, sender: &str, frame: &str) {
        let Some(members) = self.rooms.get(room) else {
            return;
        };

        let mut evicted: Vec<PeerId> = Vec::new();
        for peer_id in members {
            if peer_id == sender {
                continue;
            }
            let Some(entry) = self.peers.get(peer_id) else {
                evicted.push(peer_id.clone());
                continue;
            };
            match entry.frame_tx.try_send(frame.to_string()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("[Hub] peer {peer_id} outbound queue full, evicting");
                    evicted.push(peer_id.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    evicted.push(peer_id.clone());
                }
            }
        }

        for peer_id in evicted {
            self.unregister(&peer_id);
        }
    }

    /// Remove a peer from a room's member set, deleting the room when it
    /// becomes empty (empty rooms must not persist in the registry).
    fn leave_room(&mut self, peer_id: &str, room: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(peer_id);
            if members.is_empty() {
                log::debug!("[Hub] room {room} empty, removed");
                self.rooms.remove(room);
            }
        }
    }
}
