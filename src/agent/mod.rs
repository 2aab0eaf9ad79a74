//! Execution-agent client.
//!
//! The agent is the party that actually runs hashcat. It dials the relay,
//! generates a fresh room id, joins that room, and then services `attack`
//! envelopes arriving from the paired controller: each one is validated
//! and handed to the job runner, which streams `status_update` envelopes
//! back through this connection's outbound queue.
//!
//! The connection mirrors the relay-side peer: an inbound decode loop and
//! an outbound drain loop over a bounded queue, with the write loop as
//! the only transport writer. Job runners (one task per accepted attack)
//! are additional producers into the same queue.

use anyhow::Result;
use tokio::sync::mpsc::{self, Sender};

use crate::config::Config;
use crate::job::runner::{self, StatusSink};
use crate::job::JobTable;
use crate::protocol::{Envelope, KIND_ATTACK, KIND_JOIN};
use crate::qr;
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// A connected, room-joined agent, ready to service attack requests.
#[derive(Debug)]
pub struct Agent {
    room_id: String,
    reader: WsReader,
    writer: WsWriter,
    hashcat: std::path::PathBuf,
    queue_capacity: usize,
}

impl Agent {
    /// Resolve the hashcat executable, dial the relay, and join a freshly
    /// generated room.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable is missing, the relay is
    /// unreachable, or the join frame cannot be sent.
    pub async fn connect(config: &Config) -> Result<Self> {
        // Fail before dialing: a missing executable would otherwise only
        // surface on the first attack.
        let hashcat = config.hashcat_executable()?;

        let (mut writer, reader) = ws::connect(&config.relay_url).await?;
        let room_id = generate_room_id();
        writer
            .send_text(&Envelope::new(KIND_JOIN, &room_id).encode())
            .await?;

        log::info!("[Agent] connected to {}, room {room_id}", config.relay_url);
        Ok(Self {
            room_id,
            reader,
            writer,
            hashcat,
            queue_capacity: config.outbound_queue,
        })
    }

    /// Room id the controller must join to pair with this agent.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Run the loop pair until the connection ends.
    ///
    /// Jobs already running keep running when the transport drops; their
    /// remaining status updates are dropped with it (best-effort).
    pub async fn run(self) -> Result<()> {
        let Self {
            room_id,
            mut reader,
            mut writer,
            hashcat,
            queue_capacity,
        } = self;

        let (frame_tx, mut frame_rx) = mpsc::channel::<String>(queue_capacity);
        let write_handle = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if let Err(e) = writer.send_text(&frame).await {
                    log::error!("[Agent] write error: {e:#}");
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let jobs = JobTable::default();
        while let Some(msg) = reader.recv().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    handle_frame(&text, &room_id, &jobs, &hashcat, &frame_tx);
                }
                Ok(WsMessage::Close) => {
                    log::info!("[Agent] relay closed the connection");
                    break;
                }
                Err(e) => {
                    log::error!("[Agent] {e:#}");
                    break;
                }
            }
        }

        // Close the queue; the write loop drains what is left and exits.
        drop(frame_tx);
        let _ = write_handle.await;
        Ok(())
    }
}

/// Decode one inbound frame and start a job if it is an attack request.
///
/// Everything else is controller-to-controller traffic the agent ignores;
/// malformed frames are dropped without affecting the connection.
fn handle_frame(
    text: &str,
    room_id: &str,
    jobs: &JobTable,
    hashcat: &std::path::Path,
    frame_tx: &Sender<String>,
) {
    let envelope = match Envelope::decode(text.as_bytes()) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::debug!("[Agent] dropping malformed frame: {e:#}");
            return;
        }
    };

    if envelope.kind != KIND_ATTACK {
        return;
    }

    match envelope.job_spec() {
        Ok(spec) => {
            log::info!("[Agent] accepted attack request, job {}", spec.job_id);
            runner::spawn(
                jobs.clone(),
                spec,
                hashcat.to_path_buf(),
                StatusSink::new(room_id, frame_tx.clone()),
            );
        }
        Err(e) => {
            log::warn!("[Agent] dropping malformed attack payload: {e:#}");
        }
    }
}

/// Connect, print the pairing QR, and run until the connection ends.
pub async fn run(config: &Config) -> Result<()> {
    let agent = Agent::connect(config).await?;
    qr::print_pairing(agent.room_id());
    agent.run().await
}

/// Generate a short, QR-friendly room id (base32 of random bytes).
fn generate_room_id() -> String {
    let bytes: [u8; 5] = rand::random();
    data_encoding::BASE32_NOPAD.encode(&bytes)
}
