//! The world state tree and its mutation rules
//!
//! [`WorldTree`] pairs the replicated [`WorldState`] with the avatar registry
//! that indexes it. Every mutation checks its preconditions before touching
//! anything, so a failed delta leaves both views exactly as they were.

use crate::error::SyncError;
use crate::registry::{AvatarKey, AvatarRegistry};
use log::{debug, info};
use sync_shared::delta::{AvatarMove, EntityCreate, EntityUpdate, SceneUpdate};
use sync_shared::state::ExtensionMap;
use sync_shared::{
    now_millis, AvatarState, ChecksumAlgorithm, Delta, DeltaPayload, EntityState, Quat, Vec3,
    VectorClock, WorldState,
};

/// What a successfully applied delta touched
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Avatar(AvatarKey),
    EntityCreated(String),
    EntityUpdated(String),
    EntityDeleted(String),
    Scene,
}

#[derive(Debug)]
pub struct WorldTree {
    state: WorldState,
    registry: AvatarRegistry,
    algorithm: ChecksumAlgorithm,
}

impl WorldTree {
    pub fn new(algorithm: ChecksumAlgorithm, avatar_capacity: usize) -> Self {
        Self {
            state: WorldState::new(algorithm),
            registry: AvatarRegistry::with_capacity(avatar_capacity),
            algorithm,
        }
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    pub fn registry(&self) -> &AvatarRegistry {
        &self.registry
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Global clock: the highest applied own counter of every client
    pub fn vector_clock(&self) -> &VectorClock {
        &self.state.vector_clock
    }

    /// True when every other client's entry in the delta's clock has
    /// already been recorded by the world
    ///
    /// The originator's own entry is never checked.
    pub fn is_causally_ready(&self, delta: &Delta) -> bool {
        delta
            .vector_clock
            .iter()
            .filter(|(client_id, _)| *client_id != delta.client_id)
            .all(|(client_id, counter)| self.state.vector_clock.get(client_id) >= counter)
    }

    /// Applies a causally ready delta
    ///
    /// On success the world clock records the originator's own entry, the
    /// version is bumped and the checksum recomputed.
    pub fn apply(&mut self, delta: &Delta) -> Result<Change, SyncError> {
        let change = match &delta.payload {
            DeltaPayload::AvatarMove(payload) => self.apply_avatar_move(delta, payload),
            DeltaPayload::EntityCreate(payload) => self.apply_entity_create(delta, payload)?,
            DeltaPayload::EntityUpdate(payload) => self.apply_entity_update(delta, payload)?,
            DeltaPayload::EntityDelete(payload) => {
                if self.state.entities.remove(&payload.id).is_none() {
                    return Err(SyncError::UnknownEntity {
                        entity_id: payload.id.clone(),
                    });
                }
                Change::EntityDeleted(payload.id.clone())
            }
            DeltaPayload::SceneUpdate(payload) => self.apply_scene_update(delta, payload),
        };

        self.state
            .vector_clock
            .observe(&delta.client_id, delta.own_counter());
        self.commit();
        Ok(change)
    }

    fn commit(&mut self) {
        self.state.version += 1;
        self.state.refresh_checksum(self.algorithm);
    }

    fn apply_avatar_move(&mut self, delta: &Delta, payload: &AvatarMove) -> Change {
        let avatar_type = payload.resolved_avatar_type();
        let instance_id = payload.resolved_instance_id();
        let existing = self
            .registry
            .find_instance(&payload.session_id, &avatar_type, &instance_id)
            .cloned();

        // A move without a world keeps the avatar where it is.
        let world_id = payload
            .world_id
            .as_deref()
            .filter(|w| !w.is_empty())
            .or_else(|| existing.as_ref().and_then(|k| k.world_id.as_deref()))
            .map(str::to_string);
        let key = AvatarKey::new(
            &payload.session_id,
            world_id.as_deref(),
            Some(&avatar_type),
            Some(&instance_id),
        );

        let mut avatar = match &existing {
            Some(old) => self
                .state
                .avatars
                .remove(&old.composite())
                .unwrap_or_else(|| new_avatar(&key)),
            None => new_avatar(&key),
        };
        match existing {
            Some(old) if old != key => self.registry.rekey(&old, key.clone()),
            Some(_) => {}
            None => self.registry.insert(key.clone()),
        }

        avatar.world_id = key.world_id.clone();
        avatar.position = payload.position;
        if let Some(rotation) = payload.rotation {
            avatar.rotation = rotation;
        }
        if let Some(animation) = &payload.animation {
            avatar.animation = Some(animation.clone());
        }
        merge_extensions(&mut avatar.metadata, &payload.metadata);
        avatar.vector_clock.merge(&delta.vector_clock);
        avatar.last_update = delta.timestamp;

        self.state.avatars.insert(key.composite(), avatar);
        Change::Avatar(key)
    }

    fn apply_entity_create(&mut self, delta: &Delta, payload: &EntityCreate) -> Result<Change, SyncError> {
        if self.state.entities.contains_key(&payload.id) {
            return Err(SyncError::EntityExists {
                entity_id: payload.id.clone(),
            });
        }

        let entity = EntityState {
            id: payload.id.clone(),
            name: payload.name.clone().unwrap_or_else(|| payload.id.clone()),
            world_id: payload.world_id.clone().filter(|w| !w.is_empty()),
            position: payload.position.unwrap_or(Vec3::ZERO),
            rotation: payload.rotation.unwrap_or(Quat::IDENTITY),
            scale: payload.scale.unwrap_or(Vec3::ONE),
            components: payload.components.clone(),
            vector_clock: delta.vector_clock.clone(),
            last_update: delta.timestamp,
        };
        debug!("Entity {} created by {}", entity.id, delta.client_id);
        self.state.entities.insert(payload.id.clone(), entity);
        Ok(Change::EntityCreated(payload.id.clone()))
    }

    fn apply_entity_update(&mut self, delta: &Delta, payload: &EntityUpdate) -> Result<Change, SyncError> {
        let entity = self
            .state
            .entities
            .get_mut(&payload.id)
            .ok_or_else(|| SyncError::UnknownEntity {
                entity_id: payload.id.clone(),
            })?;

        if let Some(position) = payload.position {
            entity.position = position;
        }
        if let Some(rotation) = payload.rotation {
            entity.rotation = rotation;
        }
        if let Some(scale) = payload.scale {
            entity.scale = scale;
        }
        merge_extensions(&mut entity.components, &payload.components);
        entity.vector_clock.merge(&delta.vector_clock);
        entity.last_update = delta.timestamp;
        Ok(Change::EntityUpdated(payload.id.clone()))
    }

    fn apply_scene_update(&mut self, delta: &Delta, payload: &SceneUpdate) -> Change {
        let scene = &mut self.state.scene;
        if let Some(lighting) = &payload.lighting {
            if let Some(color) = &lighting.ambient_color {
                scene.lighting.ambient_color = color.clone();
            }
            if let Some(intensity) = lighting.ambient_intensity {
                scene.lighting.ambient_intensity = intensity;
            }
            if let Some(direction) = lighting.sun_direction {
                scene.lighting.sun_direction = direction;
            }
            if let Some(intensity) = lighting.sun_intensity {
                scene.lighting.sun_intensity = intensity;
            }
        }
        if let Some(physics) = &payload.physics {
            if let Some(gravity) = physics.gravity {
                scene.physics.gravity = gravity;
            }
            if let Some(time_scale) = physics.time_scale {
                scene.physics.time_scale = time_scale;
            }
        }
        merge_extensions(&mut scene.settings, &payload.settings);
        scene.vector_clock.merge(&delta.vector_clock);
        scene.last_update = delta.timestamp;
        Change::Scene
    }

    /// Moves the avatar found by `lookup` (exact key or session prefix)
    pub fn update_avatar_position(
        &mut self,
        lookup: &str,
        position: Vec3,
        rotation: Option<Quat>,
    ) -> Result<AvatarState, SyncError> {
        let key = self
            .registry
            .lookup(lookup)
            .cloned()
            .ok_or_else(|| SyncError::AvatarNotFound {
                key: lookup.to_string(),
            })?;
        let avatar = self
            .state
            .avatars
            .get_mut(&key.composite())
            .ok_or_else(|| SyncError::AvatarNotFound {
                key: key.composite(),
            })?;

        avatar.position = position;
        if let Some(rotation) = rotation {
            avatar.rotation = rotation;
        }
        avatar.last_update = now_millis();
        let updated = avatar.clone();
        self.commit();
        Ok(updated)
    }

    /// Places a session's avatar in `world_id` at `position`
    ///
    /// Registers the avatar when the session has none of this type and
    /// instance yet, and moves it between worlds when it is attached
    /// elsewhere.
    pub fn update_avatar_position_in_world(
        &mut self,
        key: AvatarKey,
        position: Vec3,
        rotation: Option<Quat>,
    ) -> AvatarState {
        let existing = self
            .registry
            .find_instance(&key.session_id, &key.avatar_type, &key.instance_id)
            .cloned();

        let mut avatar = match &existing {
            Some(old) => self
                .state
                .avatars
                .remove(&old.composite())
                .unwrap_or_else(|| new_avatar(&key)),
            None => {
                info!("Registered avatar {}", key);
                new_avatar(&key)
            }
        };
        match existing {
            Some(old) if old != key => {
                debug!("Avatar {} moved to {}", old, key);
                self.registry.rekey(&old, key.clone());
            }
            Some(_) => {}
            None => self.registry.insert(key.clone()),
        }

        avatar.world_id = key.world_id.clone();
        avatar.position = position;
        if let Some(rotation) = rotation {
            avatar.rotation = rotation;
        }
        avatar.last_update = now_millis();
        let updated = avatar.clone();
        self.state.avatars.insert(key.composite(), avatar);
        self.commit();
        updated
    }

    /// Detaches an avatar from its world without deleting it
    pub fn clear_avatar_world(&mut self, lookup: &str) -> Result<AvatarState, SyncError> {
        let key = self
            .registry
            .lookup(lookup)
            .cloned()
            .ok_or_else(|| SyncError::AvatarNotFound {
                key: lookup.to_string(),
            })?;
        let mut avatar = self
            .state
            .avatars
            .remove(&key.composite())
            .ok_or_else(|| SyncError::AvatarNotFound {
                key: key.composite(),
            })?;

        let detached = key.with_world(None);
        self.registry.rekey(&key, detached.clone());
        avatar.world_id = None;
        avatar.last_update = now_millis();
        let updated = avatar.clone();
        self.state.avatars.insert(detached.composite(), avatar);
        self.commit();
        Ok(updated)
    }

    /// Removes every avatar attached to `world_id` and returns how many
    pub fn clear_world(&mut self, world_id: &str) -> usize {
        let keys = self.registry.keys_in_world(world_id);
        if keys.is_empty() {
            return 0;
        }
        for key in &keys {
            let composite = key.composite();
            self.registry.remove(&composite);
            self.state.avatars.remove(&composite);
        }
        info!("Cleared {} avatars from world {}", keys.len(), world_id);
        self.commit();
        keys.len()
    }

    pub fn avatar(&self, lookup: &str) -> Option<&AvatarState> {
        let key = self.registry.lookup(lookup)?;
        self.state.avatars.get(&key.composite())
    }

    pub fn avatars_in_world(&self, world_id: &str) -> Vec<AvatarState> {
        self.registry
            .keys_in_world(world_id)
            .iter()
            .filter_map(|key| self.state.avatars.get(&key.composite()).cloned())
            .collect()
    }

    pub fn entity(&self, entity_id: &str) -> Option<&EntityState> {
        self.state.entities.get(entity_id)
    }

    /// Deep copy of the whole world
    pub fn snapshot(&self) -> WorldState {
        self.state.clone()
    }

    pub fn snapshot_for_world(&self, world_id: &str) -> WorldState {
        self.state.filtered_for_world(world_id, self.algorithm)
    }
}

fn new_avatar(key: &AvatarKey) -> AvatarState {
    AvatarState {
        session_id: key.session_id.clone(),
        world_id: key.world_id.clone(),
        avatar_type: key.avatar_type.clone(),
        instance_id: key.instance_id.clone(),
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        animation: None,
        metadata: ExtensionMap::new(),
        vector_clock: VectorClock::new(),
        last_update: 0,
    }
}

/// Merges `update` into `target`; `null` values delete keys
fn merge_extensions(target: &mut ExtensionMap, update: &ExtensionMap) {
    for (key, value) in update {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}
