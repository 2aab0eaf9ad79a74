//! Wire envelope codec for the relay protocol.
//!
//! Every frame on the wire is a JSON envelope:
//!
//! ```text
//! { "type": string, "roomId": string, "payload": <kind-dependent> }
//! ```
//!
//! The payload's concrete shape is resolved solely by `type`:
//! - `attack` carries a [`JobSpec`]
//! - `status_update` carries a [`JobStatusUpdate`]
//! - `join` carries nothing the relay inspects
//! - any other kind is opaque application data that is forwarded as-is
//!
//! Unknown kinds decode successfully — the relay never rejects a frame for
//! carrying a `type` it does not recognize. Controllers in the wild send
//! payloads both as embedded JSON objects and as JSON-encoded strings, so
//! the typed accessors accept either shape.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope kind for joining a room.
pub const KIND_JOIN: &str = "join";
/// Envelope kind carrying a [`JobSpec`].
pub const KIND_ATTACK: &str = "attack";
/// Envelope kind carrying a [`JobStatusUpdate`].
pub const KIND_STATUS_UPDATE: &str = "status_update";

/// The structured unit of communication between peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Discriminant selecting the payload schema.
    #[serde(rename = "type")]
    pub kind: String,

    /// Room identifier scoping delivery. Messages with no room are
    /// broadcast nowhere (unknown room is a no-op, not an error).
    #[serde(rename = "roomId", alias = "room_id", default)]
    pub room_id: String,

    /// Kind-dependent payload. `Null` when absent.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    /// Create an envelope with no payload.
    pub fn new(kind: &str, room_id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            room_id: room_id.to_string(),
            payload: Value::Null,
        }
    }

    /// Decode an envelope from raw frame bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a JSON object with a string
    /// `type` field. Unknown `type` values are NOT an error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("malformed envelope")
    }

    /// Encode this envelope as a JSON text frame.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization cannot fail")
    }

    /// Resolve the payload as a [`JobSpec`].
    ///
    /// # Errors
    ///
    /// Returns an error if `kind` is not `attack` or the payload does not
    /// match the job specification schema.
    pub fn job_spec(&self) -> Result<JobSpec> {
        if self.kind != KIND_ATTACK {
            anyhow::bail!("envelope kind {:?} does not carry a job spec", self.kind);
        }
        typed_payload(&self.payload).context("malformed attack payload")
    }

    /// Resolve the payload as a [`JobStatusUpdate`].
    ///
    /// # Errors
    ///
    /// Returns an error if `kind` is not `status_update` or the payload
    /// does not match the status update schema.
    pub fn status_update(&self) -> Result<JobStatusUpdate> {
        if self.kind != KIND_STATUS_UPDATE {
            anyhow::bail!("envelope kind {:?} does not carry a status update", self.kind);
        }
        typed_payload(&self.payload).context("malformed status_update payload")
    }
}

/// Deserialize a payload that may be an embedded object or a JSON-encoded
/// string (both shapes exist among deployed controllers).
fn typed_payload<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    match payload {
        Value::String(inner) => serde_json::from_str(inner).map_err(Into::into),
        other => serde_json::from_value(other.clone()).map_err(Into::into),
    }
}

/// Validated-on-receipt description of one hashcat invocation.
///
/// All fields are strings on the wire; `mode` and `attack_mode` must be
/// numeric selectors, enforced by the job runner before anything is spawned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Caller-supplied identifier, unique per concurrently-running job
    /// on a given connection.
    pub job_id: String,
    /// Path to the hash file to attack.
    pub file: String,
    /// Hash-mode selector (`-m`), numeric string.
    pub mode: String,
    /// Attack-mode selector (`-a`), numeric string.
    pub attack_mode: String,
    /// Optional wordlist path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wordlist: Option<String>,
    /// Optional rule-file path (`-r`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<String>,
}

/// Lifecycle state of a job. Terminal states are final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not yet spawned.
    Queued,
    /// Process running, output streaming.
    Running,
    /// Process exited successfully.
    Completed,
    /// Validation, spawn, or process failure.
    Failed,
}

impl JobStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One progress or terminal report for a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdate {
    /// Identifier from the originating [`JobSpec`].
    pub job_id: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Output line (while running) or accumulated output (terminal).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Human-readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatusUpdate {
    /// Wrap this update in a `status_update` envelope for the given room.
    pub fn into_envelope(self, room_id: &str) -> Envelope {
        Envelope {
            kind: KIND_STATUS_UPDATE.to_string(),
            room_id: room_id.to_string(),
            payload: serde_json::to_value(self).expect("status payload serialization cannot fail"),
        }
    }
}
