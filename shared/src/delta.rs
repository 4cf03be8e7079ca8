//! Causal operations on the world state
//!
//! A [`Delta`] carries its originator's vector-clock view, a typed payload
//! and an optional integrity checksum. Clients that speak loosely typed JSON
//! submit a [`WireDelta`] instead, which is converted with field-level
//! extraction errors.

use crate::checksum::ChecksumAlgorithm;
use crate::state::{ExtensionMap, Quat, Vec3};
use crate::vector_clock::VectorClock;
use crate::{now_millis, DEFAULT_AVATAR_TYPE, DEFAULT_INSTANCE_ID};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared kind of a delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaType {
    AvatarMove,
    EntityCreate,
    EntityUpdate,
    EntityDelete,
    SceneUpdate,
}

impl DeltaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaType::AvatarMove => "avatar_move",
            DeltaType::EntityCreate => "entity_create",
            DeltaType::EntityUpdate => "entity_update",
            DeltaType::EntityDelete => "entity_delete",
            DeltaType::SceneUpdate => "scene_update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "avatar_move" => Some(DeltaType::AvatarMove),
            "entity_create" => Some(DeltaType::EntityCreate),
            "entity_update" => Some(DeltaType::EntityUpdate),
            "entity_delete" => Some(DeltaType::EntityDelete),
            "scene_update" => Some(DeltaType::SceneUpdate),
            _ => None,
        }
    }
}

impl fmt::Display for DeltaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarMove {
    pub session_id: String,
    #[serde(default)]
    pub world_id: Option<String>,
    #[serde(default)]
    pub avatar_type: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    pub position: Vec3,
    #[serde(default)]
    pub rotation: Option<Quat>,
    #[serde(default)]
    pub animation: Option<String>,
    #[serde(default)]
    pub metadata: ExtensionMap,
}

impl AvatarMove {
    /// Avatar type from the explicit field, then metadata, then the default
    pub fn resolved_avatar_type(&self) -> String {
        self.avatar_type
            .clone()
            .or_else(|| metadata_str(&self.metadata, "avatar_type"))
            .unwrap_or_else(|| DEFAULT_AVATAR_TYPE.to_string())
    }

    /// Instance id from the explicit field, then metadata, then `"0"`
    pub fn resolved_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .or_else(|| metadata_str(&self.metadata, "instance_id"))
            .unwrap_or_else(|| DEFAULT_INSTANCE_ID.to_string())
    }
}

fn metadata_str(metadata: &ExtensionMap, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|value| value.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCreate {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub world_id: Option<String>,
    #[serde(default)]
    pub position: Option<Vec3>,
    #[serde(default)]
    pub rotation: Option<Quat>,
    #[serde(default)]
    pub scale: Option<Vec3>,
    #[serde(default)]
    pub components: ExtensionMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub id: String,
    #[serde(default)]
    pub position: Option<Vec3>,
    #[serde(default)]
    pub rotation: Option<Quat>,
    #[serde(default)]
    pub scale: Option<Vec3>,
    /// Merged into the entity's components; a `null` value removes the key
    #[serde(default)]
    pub components: ExtensionMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDelete {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LightingUpdate {
    #[serde(default)]
    pub ambient_color: Option<String>,
    #[serde(default)]
    pub ambient_intensity: Option<f32>,
    #[serde(default)]
    pub sun_direction: Option<Vec3>,
    #[serde(default)]
    pub sun_intensity: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicsUpdate {
    #[serde(default)]
    pub gravity: Option<Vec3>,
    #[serde(default)]
    pub time_scale: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneUpdate {
    #[serde(default)]
    pub lighting: Option<LightingUpdate>,
    #[serde(default)]
    pub physics: Option<PhysicsUpdate>,
    #[serde(default)]
    pub settings: ExtensionMap,
}

/// Typed payload, one variant per known delta type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DeltaPayload {
    AvatarMove(AvatarMove),
    EntityCreate(EntityCreate),
    EntityUpdate(EntityUpdate),
    EntityDelete(EntityDelete),
    SceneUpdate(SceneUpdate),
}

/// Problems found while extracting or validating a payload
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("unknown delta type '{0}'")]
    UnknownType(String),
    #[error("cannot decode {delta_type} payload: {details}")]
    Decode { delta_type: DeltaType, details: String },
    #[error("field '{field}' {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

fn require_id(field: &'static str, value: &str) -> Result<(), PayloadError> {
    if value.trim().is_empty() {
        return Err(PayloadError::Invalid { field, reason: "must not be empty" });
    }
    Ok(())
}

fn require_finite_vec(field: &'static str, value: Option<&Vec3>) -> Result<(), PayloadError> {
    match value {
        Some(v) if !v.is_finite() => Err(PayloadError::Invalid { field, reason: "must be finite" }),
        _ => Ok(()),
    }
}

fn require_finite_quat(field: &'static str, value: Option<&Quat>) -> Result<(), PayloadError> {
    match value {
        Some(q) if !q.is_finite() => Err(PayloadError::Invalid { field, reason: "must be finite" }),
        _ => Ok(()),
    }
}

fn require_finite(field: &'static str, value: Option<f32>) -> Result<(), PayloadError> {
    match value {
        Some(v) if !v.is_finite() => Err(PayloadError::Invalid { field, reason: "must be finite" }),
        _ => Ok(()),
    }
}

impl DeltaPayload {
    pub fn delta_type(&self) -> DeltaType {
        match self {
            DeltaPayload::AvatarMove(_) => DeltaType::AvatarMove,
            DeltaPayload::EntityCreate(_) => DeltaType::EntityCreate,
            DeltaPayload::EntityUpdate(_) => DeltaType::EntityUpdate,
            DeltaPayload::EntityDelete(_) => DeltaType::EntityDelete,
            DeltaPayload::SceneUpdate(_) => DeltaType::SceneUpdate,
        }
    }

    /// Extracts a typed payload from a declared type and free-form data
    pub fn from_parts(delta_type: &str, data: serde_json::Value) -> Result<Self, PayloadError> {
        let kind = DeltaType::parse(delta_type)
            .ok_or_else(|| PayloadError::UnknownType(delta_type.to_string()))?;
        let decode_err = |e: serde_json::Error| PayloadError::Decode {
            delta_type: kind,
            details: e.to_string(),
        };

        let payload = match kind {
            DeltaType::AvatarMove => DeltaPayload::AvatarMove(serde_json::from_value(data).map_err(decode_err)?),
            DeltaType::EntityCreate => DeltaPayload::EntityCreate(serde_json::from_value(data).map_err(decode_err)?),
            DeltaType::EntityUpdate => DeltaPayload::EntityUpdate(serde_json::from_value(data).map_err(decode_err)?),
            DeltaType::EntityDelete => DeltaPayload::EntityDelete(serde_json::from_value(data).map_err(decode_err)?),
            DeltaType::SceneUpdate => DeltaPayload::SceneUpdate(serde_json::from_value(data).map_err(decode_err)?),
        };
        Ok(payload)
    }

    /// Free-form data for the wire
    pub fn data(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            DeltaPayload::AvatarMove(p) => serde_json::to_value(p),
            DeltaPayload::EntityCreate(p) => serde_json::to_value(p),
            DeltaPayload::EntityUpdate(p) => serde_json::to_value(p),
            DeltaPayload::EntityDelete(p) => serde_json::to_value(p),
            DeltaPayload::SceneUpdate(p) => serde_json::to_value(p),
        }
    }

    /// Checks the value constraints serde cannot express
    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            DeltaPayload::AvatarMove(p) => {
                require_id("session_id", &p.session_id)?;
                require_finite_vec("position", Some(&p.position))?;
                require_finite_quat("rotation", p.rotation.as_ref())
            }
            DeltaPayload::EntityCreate(p) => {
                require_id("id", &p.id)?;
                require_finite_vec("position", p.position.as_ref())?;
                require_finite_quat("rotation", p.rotation.as_ref())?;
                require_finite_vec("scale", p.scale.as_ref())
            }
            DeltaPayload::EntityUpdate(p) => {
                require_id("id", &p.id)?;
                require_finite_vec("position", p.position.as_ref())?;
                require_finite_quat("rotation", p.rotation.as_ref())?;
                require_finite_vec("scale", p.scale.as_ref())
            }
            DeltaPayload::EntityDelete(p) => require_id("id", &p.id),
            DeltaPayload::SceneUpdate(p) => {
                if let Some(lighting) = &p.lighting {
                    require_finite("lighting.ambient_intensity", lighting.ambient_intensity)?;
                    require_finite("lighting.sun_intensity", lighting.sun_intensity)?;
                    require_finite_vec("lighting.sun_direction", lighting.sun_direction.as_ref())?;
                }
                if let Some(physics) = &p.physics {
                    require_finite_vec("physics.gravity", physics.gravity.as_ref())?;
                    require_finite("physics.time_scale", physics.time_scale)?;
                }
                Ok(())
            }
        }
    }
}

/// One causally tracked mutation of the world state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub id: String,
    pub client_id: String,
    pub payload: DeltaPayload,
    /// The originator's causal view when the delta was created
    pub vector_clock: VectorClock,
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: u64,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Fields covered by a delta checksum
#[derive(Serialize)]
struct DeltaChecksumView<'a> {
    id: &'a str,
    client_id: &'a str,
    payload: &'a DeltaPayload,
    vector_clock: &'a VectorClock,
    timestamp: u64,
}

impl Delta {
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        vector_clock: VectorClock,
        payload: DeltaPayload,
    ) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            payload,
            vector_clock,
            timestamp: now_millis(),
            checksum: None,
        }
    }

    /// Creates the next delta in `client_id`'s causal chain
    ///
    /// Advances the client's own entry in `clock` and stamps the delta with
    /// the resulting view. The id is `<client>-<counter>`.
    pub fn next(client_id: &str, clock: &mut VectorClock, payload: DeltaPayload) -> Self {
        let counter = clock.increment(client_id);
        Self::new(format!("{}-{}", client_id, counter), client_id, clock.clone(), payload)
    }

    pub fn delta_type(&self) -> DeltaType {
        self.payload.delta_type()
    }

    /// The originator's own counter carried by this delta
    pub fn own_counter(&self) -> u64 {
        self.vector_clock.get(&self.client_id)
    }

    pub fn compute_checksum(&self, algorithm: ChecksumAlgorithm) -> String {
        let view = DeltaChecksumView {
            id: &self.id,
            client_id: &self.client_id,
            payload: &self.payload,
            vector_clock: &self.vector_clock,
            timestamp: self.timestamp,
        };
        algorithm
            .digest_json(&view)
            .expect("delta should always be JSON-serializable")
    }

    /// Attaches a checksum over the delta's current content
    pub fn seal(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.checksum = Some(self.compute_checksum(algorithm));
        self
    }

    /// False only when a checksum is present and does not match
    pub fn integrity_ok(&self, algorithm: ChecksumAlgorithm) -> bool {
        match &self.checksum {
            Some(checksum) => *checksum == self.compute_checksum(algorithm),
            None => true,
        }
    }

    pub fn to_wire(&self) -> Result<WireDelta, serde_json::Error> {
        Ok(WireDelta {
            id: self.id.clone(),
            client_id: self.client_id.clone(),
            delta_type: self.delta_type().as_str().to_string(),
            data: self.payload.data()?,
            vector_clock: self.vector_clock.clone(),
            timestamp: self.timestamp,
            checksum: self.checksum.clone(),
        })
    }
}

/// Loosely typed delta as submitted by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDelta {
    pub id: String,
    pub client_id: String,
    #[serde(rename = "type")]
    pub delta_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub vector_clock: VectorClock,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl TryFrom<WireDelta> for Delta {
    type Error = PayloadError;

    fn try_from(wire: WireDelta) -> Result<Self, Self::Error> {
        let payload = DeltaPayload::from_parts(&wire.delta_type, wire.data)?;
        let timestamp = if wire.timestamp == 0 { now_millis() } else { wire.timestamp };
        Ok(Delta {
            id: wire.id,
            client_id: wire.client_id,
            payload,
            vector_clock: wire.vector_clock,
            timestamp,
            checksum: wire.checksum,
        })
    }
}
