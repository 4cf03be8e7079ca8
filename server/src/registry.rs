//! Composite-keyed avatar index
//!
//! A session may control several avatars (different types, or several
//! instances of one type) and each avatar may be attached to at most one
//! world. The registry maps the composite key
//! `session:world:avatar_type:instance` to its parts and keeps a per-session
//! index so callers that only know a session id can still find an avatar.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use sync_shared::{DEFAULT_AVATAR_TYPE, DEFAULT_INSTANCE_ID, NO_WORLD};

/// Parts of a composite avatar key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AvatarKey {
    pub session_id: String,
    /// `None` when the avatar is not in any world
    pub world_id: Option<String>,
    pub avatar_type: String,
    pub instance_id: String,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

impl AvatarKey {
    /// Builds a key, applying the defaults for absent parts
    ///
    /// An empty or absent world maps to [`NO_WORLD`], an absent avatar type
    /// to [`DEFAULT_AVATAR_TYPE`] and an absent instance to `"0"`.
    pub fn new(
        session_id: &str,
        world_id: Option<&str>,
        avatar_type: Option<&str>,
        instance_id: Option<&str>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            world_id: non_empty(world_id).map(str::to_string),
            avatar_type: non_empty(avatar_type).unwrap_or(DEFAULT_AVATAR_TYPE).to_string(),
            instance_id: non_empty(instance_id).unwrap_or(DEFAULT_INSTANCE_ID).to_string(),
        }
    }

    /// `session:world:avatar_type:instance`, with [`NO_WORLD`] for no world
    pub fn composite(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.session_id,
            self.world_id.as_deref().unwrap_or(NO_WORLD),
            self.avatar_type,
            self.instance_id
        )
    }

    /// Same avatar, attached to another world (or none)
    pub fn with_world(&self, world_id: Option<&str>) -> Self {
        Self {
            world_id: non_empty(world_id).map(str::to_string),
            ..self.clone()
        }
    }

    /// True when both keys name the same avatar, ignoring the world
    pub fn same_avatar(&self, other: &AvatarKey) -> bool {
        self.session_id == other.session_id
            && self.avatar_type == other.avatar_type
            && self.instance_id == other.instance_id
    }
}

impl fmt::Display for AvatarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.composite())
    }
}

#[derive(Debug)]
pub struct AvatarRegistry {
    /// Composite key -> parts
    entries: HashMap<String, AvatarKey>,
    /// Session id -> composite keys, ordered for deterministic fallback
    sessions: HashMap<String, BTreeSet<String>>,
}

impl AvatarRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            sessions: HashMap::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, key: AvatarKey) {
        let composite = key.composite();
        self.sessions
            .entry(key.session_id.clone())
            .or_default()
            .insert(composite.clone());
        self.entries.insert(composite, key);
    }

    /// Removes an entry by its exact composite key
    pub fn remove(&mut self, composite: &str) -> Option<AvatarKey> {
        let key = self.entries.remove(composite)?;
        if let Some(keys) = self.sessions.get_mut(&key.session_id) {
            keys.remove(composite);
            if keys.is_empty() {
                self.sessions.remove(&key.session_id);
            }
        }
        Some(key)
    }

    /// Moves an entry to a new key
    pub fn rekey(&mut self, old: &AvatarKey, new: AvatarKey) {
        self.remove(&old.composite());
        self.insert(new);
    }

    /// Resolves an exact composite key or, failing that, a prefix of one
    ///
    /// A bare session id resolves to that session's first avatar in key
    /// order. Longer prefixes such as `session:world` are also accepted.
    pub fn lookup(&self, key_or_prefix: &str) -> Option<&AvatarKey> {
        if let Some(key) = self.entries.get(key_or_prefix) {
            return Some(key);
        }
        if let Some(first) = self
            .sessions
            .get(key_or_prefix)
            .and_then(|keys| keys.iter().next())
        {
            return self.entries.get(first);
        }

        let prefix = format!("{}:", key_or_prefix);
        self.entries
            .iter()
            .filter(|(composite, _)| composite.starts_with(&prefix))
            .min_by(|a, b| a.0.cmp(b.0))
            .map(|(_, key)| key)
    }

    /// Finds an avatar by session, type and instance regardless of world
    pub fn find_instance(&self, session_id: &str, avatar_type: &str, instance_id: &str) -> Option<&AvatarKey> {
        self.sessions
            .get(session_id)?
            .iter()
            .filter_map(|composite| self.entries.get(composite))
            .find(|key| key.avatar_type == avatar_type && key.instance_id == instance_id)
    }

    /// Every key a session owns, in key order
    pub fn keys_for_session(&self, session_id: &str) -> Vec<AvatarKey> {
        self.sessions
            .get(session_id)
            .map(|keys| keys.iter().filter_map(|c| self.entries.get(c).cloned()).collect())
            .unwrap_or_default()
    }

    /// Keys attached to a world, sorted
    pub fn keys_in_world(&self, world_id: &str) -> Vec<AvatarKey> {
        let mut keys: Vec<AvatarKey> = self
            .entries
            .values()
            .filter(|key| key.world_id.as_deref() == Some(world_id))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
