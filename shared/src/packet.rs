//! Messages exchanged between clients and the session hub
//!
//! Packets travel as JSON text frames. Client-originated variants come
//! first, followed by the hub's responses and pushes.

use crate::delta::{Delta, WireDelta};
use crate::operation::Operation;
use crate::state::{Vec3, WorldState};
use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};

/// A delta the engine refused, with whether resubmitting may succeed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub delta_id: String,
    pub reason: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    Connect {
        client_id: String,
        session_id: String,
    },
    JoinWorld {
        world_id: String,
        #[serde(default)]
        avatar_type: Option<String>,
        #[serde(default)]
        instance_id: Option<String>,
        #[serde(default)]
        position: Option<Vec3>,
    },
    LeaveWorld {
        #[serde(default)]
        avatar_type: Option<String>,
        #[serde(default)]
        instance_id: Option<String>,
    },
    SubmitDelta {
        delta: WireDelta,
    },
    SyncDeltas {
        deltas: Vec<WireDelta>,
    },
    SubmitOperation {
        op_type: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Ack {
        sequence: u64,
    },
    RequestMissing {
        from: u64,
        to: u64,
    },
    RequestSnapshot {
        #[serde(default)]
        world_id: Option<String>,
    },
    Disconnect,

    Connected {
        client_id: String,
        vector_clock: VectorClock,
        current_sequence: u64,
        snapshot: WorldState,
    },
    Snapshot {
        state: WorldState,
    },
    DeltaApplied {
        delta: Delta,
        version: u64,
        checksum: String,
    },
    DeltaQueued {
        delta_id: String,
        queued: usize,
    },
    DeltaRejected {
        rejection: Rejection,
    },
    DeltaExpired {
        delta_id: String,
    },
    SyncResult {
        confirmed: Vec<Delta>,
        deferred: Vec<String>,
        rejected: Vec<Rejection>,
        version: u64,
        checksum: String,
    },
    OperationBroadcast {
        operation: Operation,
    },
    Operations {
        operations: Vec<Operation>,
    },
    StateDigest {
        version: u64,
        checksum: String,
    },
    Error {
        message: String,
    },
    Disconnected {
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("malformed packet: {0}")]
pub struct CodecError(#[from] serde_json::Error);

impl Packet {
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }
}
