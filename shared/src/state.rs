//! Replicated world state shared between the engine and its clients
//!
//! The engine owns the authoritative [`WorldState`]; clients receive deep
//! copies of it as snapshots. All maps are `BTreeMap`s so that two replicas
//! holding the same content produce byte-identical JSON and therefore the
//! same checksum.

use crate::checksum::ChecksumAlgorithm;
use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque component/metadata map for data the engine does not interpret
pub type ExtensionMap = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };
    pub const ONE: Vec3 = Vec3 { x: 1.0, y: 1.0, z: 1.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Orientation as a quaternion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite()
    }
}

impl Default for Quat {
    fn default() -> Self {
        Quat::IDENTITY
    }
}

/// One avatar's replicated state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarState {
    pub session_id: String,
    /// `None` while the avatar is not attached to any world
    pub world_id: Option<String>,
    pub avatar_type: String,
    pub instance_id: String,
    pub position: Vec3,
    pub rotation: Quat,
    pub animation: Option<String>,
    pub metadata: ExtensionMap,
    pub vector_clock: VectorClock,
    /// Timestamp (ms) of the delta that last touched this avatar
    pub last_update: u64,
}

/// One scene object's replicated state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: String,
    pub name: String,
    /// `None` for entities visible in every world
    pub world_id: Option<String>,
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub components: ExtensionMap,
    pub vector_clock: VectorClock,
    pub last_update: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lighting {
    pub ambient_color: String,
    pub ambient_intensity: f32,
    pub sun_direction: Vec3,
    pub sun_intensity: f32,
}

impl Default for Lighting {
    fn default() -> Self {
        Self {
            ambient_color: "#ffffff".to_string(),
            ambient_intensity: 0.5,
            sun_direction: Vec3::new(0.0, -1.0, 0.0),
            sun_intensity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Physics {
    pub gravity: Vec3,
    pub time_scale: f32,
}

impl Default for Physics {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            time_scale: 1.0,
        }
    }
}

/// Global scene parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneState {
    pub lighting: Lighting,
    pub physics: Physics,
    /// Scene parameters outside lighting and physics
    pub settings: ExtensionMap,
    pub vector_clock: VectorClock,
    pub last_update: u64,
}

/// Whole synchronized scene
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    /// Avatars keyed by their composite avatar key
    pub avatars: BTreeMap<String, AvatarState>,
    pub entities: BTreeMap<String, EntityState>,
    pub scene: SceneState,
    pub vector_clock: VectorClock,
    /// Local mutation counter; not covered by the checksum
    pub version: u64,
    pub checksum: String,
}

/// The parts of a world state that the checksum covers
///
/// `version` and `checksum` are excluded so replicas that applied the same
/// deltas in a different (causally valid) order still agree.
#[derive(Serialize)]
struct ChecksumView<'a> {
    avatars: &'a BTreeMap<String, AvatarState>,
    entities: &'a BTreeMap<String, EntityState>,
    scene: &'a SceneState,
    vector_clock: &'a VectorClock,
}

impl WorldState {
    /// Creates an empty world with its checksum already computed
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let mut state = Self::default();
        state.refresh_checksum(algorithm);
        state
    }

    pub fn compute_checksum(&self, algorithm: ChecksumAlgorithm) -> String {
        let view = ChecksumView {
            avatars: &self.avatars,
            entities: &self.entities,
            scene: &self.scene,
            vector_clock: &self.vector_clock,
        };
        algorithm
            .digest_json(&view)
            .expect("world state should always be JSON-serializable")
    }

    pub fn refresh_checksum(&mut self, algorithm: ChecksumAlgorithm) {
        self.checksum = self.compute_checksum(algorithm);
    }

    /// True when the stored checksum matches the content
    pub fn verify_checksum(&self, algorithm: ChecksumAlgorithm) -> bool {
        self.checksum == self.compute_checksum(algorithm)
    }

    /// Copy restricted to one world
    ///
    /// Keeps avatars attached to `world_id` and entities that either belong
    /// to it or to no world at all. The checksum is recomputed over the
    /// filtered content so receivers can verify what they got.
    pub fn filtered_for_world(&self, world_id: &str, algorithm: ChecksumAlgorithm) -> WorldState {
        let avatars = self
            .avatars
            .iter()
            .filter(|(_, avatar)| avatar.world_id.as_deref() == Some(world_id))
            .map(|(key, avatar)| (key.clone(), avatar.clone()))
            .collect();
        let entities = self
            .entities
            .iter()
            .filter(|(_, entity)| match entity.world_id.as_deref() {
                None => true,
                Some(id) => id == world_id,
            })
            .map(|(id, entity)| (id.clone(), entity.clone()))
            .collect();

        let mut filtered = WorldState {
            avatars,
            entities,
            scene: self.scene.clone(),
            vector_clock: self.vector_clock.clone(),
            version: self.version,
            checksum: String::new(),
        };
        filtered.refresh_checksum(algorithm);
        filtered
    }
}
