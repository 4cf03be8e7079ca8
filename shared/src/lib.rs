//! # Shared World Synchronization Types
//!
//! Types used on both sides of the synchronization engine: the engine keeps
//! the authoritative copies, clients receive snapshots and deltas built from
//! the same definitions.
//!
//! ## Module Organization
//!
//! - `vector_clock`: per-client logical counters and their causal ordering
//! - `checksum`: SHA-256 / MD5 / BLAKE3 integrity digests over canonical JSON
//! - `delta`: causal operations with typed payloads and the loose wire form
//! - `state`: the replicated world (avatars, entities, scene)
//! - `operation`: totally ordered operations for the sequence layer
//! - `packet`: client/hub messages and their JSON codec

pub mod checksum;
pub mod delta;
pub mod operation;
pub mod packet;
pub mod state;
pub mod vector_clock;

pub use checksum::ChecksumAlgorithm;
pub use delta::{Delta, DeltaPayload, DeltaType, PayloadError, WireDelta};
pub use operation::Operation;
pub use packet::{Packet, Rejection};
pub use state::{AvatarState, EntityState, Quat, SceneState, Vec3, WorldState};
pub use vector_clock::VectorClock;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Avatar type used when neither the payload nor its metadata names one
pub const DEFAULT_AVATAR_TYPE: &str = "default";
/// Instance id used when neither the payload nor its metadata names one
pub const DEFAULT_INSTANCE_ID: &str = "0";
/// World component of an avatar key for avatars outside any world
pub const NO_WORLD: &str = "_";

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_advances() {
        let first = now_millis();
        std::thread::sleep(Duration::from_millis(2));
        assert!(now_millis() > first);
    }

    #[test]
    fn test_defaults_are_stable() {
        assert_eq!(DEFAULT_INSTANCE_ID, "0");
        assert_eq!(DEFAULT_AVATAR_TYPE, "default");
        assert!(!NO_WORLD.is_empty());
    }
}
