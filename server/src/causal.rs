//! Causal synchronization engine
//!
//! Deltas are applied to the world as soon as everything they causally
//! depend on has been applied. Deltas that arrive early wait in a bounded
//! deferred queue; a background worker retries them whenever the world's
//! vector clock advances and drops the ones that wait longer than the
//! causality timeout.
//!
//! All engine state sits behind one `RwLock`. Snapshots take the read side,
//! every mutation takes the write side, and nothing awaits while holding it
//! except the lock acquisition itself.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::registry::AvatarKey;
use crate::world::{Change, WorldTree};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use sync_shared::{now_millis, AvatarState, Delta, EntityState, Quat, Vec3, VectorClock, WorldState};
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;

const MIN_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of a delta that made it into the world
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedDelta {
    /// The delta as it was applied
    pub delta: Delta,
    /// Which part of the world it touched
    pub change: Change,
    /// World version right after the apply
    pub version: u64,
    /// World checksum right after the apply
    pub checksum: String,
    /// True when the delta waited in the deferred queue first
    pub deferred: bool,
}

/// What `apply_delta` did with an accepted delta
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(AppliedDelta),
    /// Not causally ready yet; `queued` deltas are now waiting
    Deferred { delta_id: String, queued: usize },
}

/// A deferred delta dropped after the causality timeout
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredDelta {
    pub delta_id: String,
    /// Originating client, the one to notify
    pub client_id: String,
    /// Time spent in the deferred queue
    pub waited_ms: u64,
}

/// Outcome of one pass over the deferred queue
#[derive(Debug, Default)]
pub struct ResolveReport {
    pub applied: Vec<AppliedDelta>,
    pub expired: Vec<ExpiredDelta>,
    pub rejected: Vec<(String, SyncError)>,
}

/// Server-authoritative answer to a batch of client-predicted deltas
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Deltas the server has applied, in application order
    pub confirmed: Vec<Delta>,
    /// Ids still waiting on causality
    pub deferred: Vec<String>,
    /// Ids the client should roll back, with the reason
    pub rejected: Vec<(String, SyncError)>,
    /// World version after the batch
    pub version: u64,
    pub checksum: String,
    /// The client's clock after catching up with the world
    pub vector_clock: VectorClock,
}

/// Replication bookkeeping for one connected client
#[derive(Debug, Clone)]
pub struct ClientState {
    pub client_id: String,
    /// Session the client connection belongs to
    pub session_id: String,
    /// What the server knows the client has seen
    pub vector_clock: VectorClock,
    /// Deltas the client applied locally that the server has not confirmed
    pub predicted: BTreeMap<String, Delta>,
    /// Most recently confirmed delta ids, oldest first
    pub confirmed: VecDeque<String>,
    /// Unix time of the last reconciliation (ms)
    pub last_sync: u64,
}

impl ClientState {
    fn new(client_id: &str, session_id: &str, vector_clock: VectorClock) -> Self {
        Self {
            client_id: client_id.to_string(),
            session_id: session_id.to_string(),
            vector_clock,
            predicted: BTreeMap::new(),
            confirmed: VecDeque::new(),
            last_sync: now_millis(),
        }
    }
}

/// Observability snapshot of the causal engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub version: u64,
    pub checksum: String,
    /// Avatars currently in the world
    pub avatars: usize,
    /// Entities currently in the world
    pub entities: usize,
    /// Registered clients
    pub clients: usize,
    /// Deltas waiting on causality right now
    pub deferred: usize,
    /// Applied deltas retained in the operation log
    pub log_len: usize,
    /// Lifetime counters
    pub applied_total: u64,
    pub deferred_total: u64,
    pub expired_total: u64,
    pub rejected_total: u64,
}

#[derive(Debug)]
struct DeferredDelta {
    delta: Delta,
    queued_at: Instant,
}

/// Own counters of one client that have been applied
///
/// Everything at or below `watermark` is applied; `above` holds the sparse
/// counters past the first gap and folds into the watermark as gaps fill.
#[derive(Debug, Default)]
struct AppliedCounters {
    watermark: u64,
    above: BTreeSet<u64>,
}

impl AppliedCounters {
    fn contains(&self, counter: u64) -> bool {
        counter <= self.watermark || self.above.contains(&counter)
    }

    /// Records a counter, keeping at most `limit` entries above the watermark
    ///
    /// When the limit is exceeded the oldest gap is closed: a counter that
    /// never arrived in time is treated as spent rather than applied later.
    fn insert(&mut self, counter: u64, limit: usize) {
        if counter <= self.watermark {
            return;
        }
        self.above.insert(counter);
        while self.above.len() > limit {
            match self.above.pop_first() {
                Some(oldest) => self.watermark = oldest,
                None => break,
            }
        }
        while self.above.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    applied: u64,
    deferred: u64,
    expired: u64,
    rejected: u64,
}

struct EngineState {
    tree: WorldTree,
    clients: HashMap<String, ClientState>,
    deferred: VecDeque<DeferredDelta>,
    /// Applied deltas, oldest first, bounded by `max_operation_log`
    log: VecDeque<Delta>,
    /// Ids of the deltas in `log`
    applied_ids: HashSet<String>,
    /// Per-client applied own counters; outlives the log
    applied_counters: HashMap<String, AppliedCounters>,
    counters: Counters,
    max_log: usize,
}

impl EngineState {
    fn is_known(&self, delta: &Delta) -> bool {
        self.was_applied(delta) || self.deferred.iter().any(|d| d.delta.id == delta.id)
    }

    /// True for a delta whose id is still in the log, or whose originator
    /// counter has already been applied
    fn was_applied(&self, delta: &Delta) -> bool {
        if self.applied_ids.contains(&delta.id) {
            return true;
        }
        let counter = delta.own_counter();
        counter > 0
            && self
                .applied_counters
                .get(&delta.client_id)
                .is_some_and(|applied| applied.contains(counter))
    }

    /// Applies a delta already known to be causally ready
    fn apply_ready(&mut self, delta: Delta, deferred: bool) -> Result<AppliedDelta, SyncError> {
        if self.was_applied(&delta) {
            return Err(SyncError::DuplicateDelta { delta_id: delta.id });
        }
        let change = match self.tree.apply(&delta) {
            Ok(change) => change,
            Err(e) => {
                self.counters.rejected += 1;
                if let Some(client) = self.clients.get_mut(&delta.client_id) {
                    client.predicted.remove(&delta.id);
                }
                return Err(e);
            }
        };

        if let Some(client) = self.clients.get_mut(&delta.client_id) {
            client.vector_clock.merge(&delta.vector_clock);
            if client.predicted.remove(&delta.id).is_some() {
                client.confirmed.push_back(delta.id.clone());
                while client.confirmed.len() > self.max_log {
                    client.confirmed.pop_front();
                }
            }
        }

        let counter = delta.own_counter();
        if counter > 0 {
            self.applied_counters
                .entry(delta.client_id.clone())
                .or_default()
                .insert(counter, self.max_log);
        }
        self.applied_ids.insert(delta.id.clone());
        self.log.push_back(delta.clone());
        while self.log.len() > self.max_log {
            if let Some(evicted) = self.log.pop_front() {
                self.applied_ids.remove(&evicted.id);
            }
        }
        self.counters.applied += 1;

        let state = self.tree.state();
        Ok(AppliedDelta {
            delta,
            change,
            version: state.version,
            checksum: state.checksum.clone(),
            deferred,
        })
    }
}

struct EngineInner {
    config: SyncConfig,
    state: RwLock<EngineState>,
    /// Signalled whenever the world's vector clock advances
    clock_advanced: Notify,
    applied_tx: broadcast::Sender<AppliedDelta>,
    expired_tx: broadcast::Sender<ExpiredDelta>,
}

/// Handle to one engine instance; clones share the same world
#[derive(Clone)]
pub struct CausalSyncEngine {
    inner: Arc<EngineInner>,
}

impl CausalSyncEngine {
    /// Creates an empty world; the resolution worker is started separately
    pub fn new(config: SyncConfig) -> Self {
        let tree = WorldTree::new(config.checksum_algorithm, config.avatar_registry_capacity);
        let state = EngineState {
            tree,
            clients: HashMap::new(),
            deferred: VecDeque::new(),
            log: VecDeque::new(),
            applied_ids: HashSet::new(),
            applied_counters: HashMap::new(),
            counters: Counters::default(),
            max_log: config.max_operation_log.max(1),
        };
        // A single resolve pass can emit every deferred delta at once
        let capacity = config.max_deferred_deltas.max(MIN_EVENT_CHANNEL_CAPACITY);
        let (applied_tx, _) = broadcast::channel(capacity);
        let (expired_tx, _) = broadcast::channel(capacity);

        Self {
            inner: Arc::new(EngineInner {
                config,
                state: RwLock::new(state),
                clock_advanced: Notify::new(),
                applied_tx,
                expired_tx,
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Applies a delta, or defers it when it is not causally ready
    ///
    /// Never waits for causality: a blocked delta is queued, and when the
    /// queue is full the call fails with [`SyncError::CausalityViolation`].
    pub async fn apply_delta(&self, delta: Delta) -> Result<ApplyOutcome, SyncError> {
        let algorithm = self.inner.config.checksum_algorithm;
        if !delta.integrity_ok(algorithm) {
            warn!("Rejected delta {} from {}: checksum mismatch", delta.id, delta.client_id);
            self.inner.state.write().await.counters.rejected += 1;
            return Err(SyncError::IntegrityFailure { delta_id: delta.id });
        }
        if let Err(e) = delta.payload.validate() {
            self.inner.state.write().await.counters.rejected += 1;
            return Err(SyncError::malformed(&delta.id, e));
        }

        let mut state = self.inner.state.write().await;
        if state.is_known(&delta) {
            return Err(SyncError::DuplicateDelta { delta_id: delta.id });
        }

        if state.tree.is_causally_ready(&delta) {
            let applied = state.apply_ready(delta, false)?;
            drop(state);
            self.inner.clock_advanced.notify_one();
            let _ = self.inner.applied_tx.send(applied.clone());
            return Ok(ApplyOutcome::Applied(applied));
        }

        let queued = state.deferred.len();
        if queued >= self.inner.config.max_deferred_deltas {
            warn!(
                "Deferred queue full ({} waiting), rejecting delta {} from {}",
                queued, delta.id, delta.client_id
            );
            return Err(SyncError::CausalityViolation {
                delta_id: delta.id,
                queued,
            });
        }

        debug!(
            "Deferring delta {} from {}: clock {} not satisfied by world {}",
            delta.id,
            delta.client_id,
            delta.vector_clock,
            state.tree.vector_clock()
        );
        let delta_id = delta.id.clone();
        state.deferred.push_back(DeferredDelta {
            delta,
            queued_at: Instant::now(),
        });
        state.counters.deferred += 1;
        Ok(ApplyOutcome::Deferred {
            delta_id,
            queued: state.deferred.len(),
        })
    }

    /// Applies every deferred delta that has become ready and expires the
    /// ones past the causality timeout
    ///
    /// Ready deltas are applied in arrival order, repeating until a pass
    /// makes no progress so chains of dependent deltas land together.
    pub async fn resolve_deferred(&self) -> ResolveReport {
        let mut report = ResolveReport::default();
        if self.inner.state.read().await.deferred.is_empty() {
            return report;
        }

        let timeout = self.inner.config.causality_timeout();
        {
            let mut state = self.inner.state.write().await;
            loop {
                let mut progressed = false;
                let mut index = 0;
                while index < state.deferred.len() {
                    if !state.tree.is_causally_ready(&state.deferred[index].delta) {
                        index += 1;
                        continue;
                    }
                    let Some(entry) = state.deferred.remove(index) else {
                        break;
                    };
                    let delta_id = entry.delta.id.clone();
                    match state.apply_ready(entry.delta, true) {
                        Ok(applied) => {
                            debug!(
                                "Resolved deferred delta {} after {:?}",
                                delta_id,
                                entry.queued_at.elapsed()
                            );
                            report.applied.push(applied);
                            progressed = true;
                        }
                        Err(e) => {
                            warn!("Deferred delta {} rejected on apply: {}", delta_id, e);
                            report.rejected.push((delta_id, e));
                        }
                    }
                }
                if !progressed {
                    break;
                }
            }

            let mut kept = VecDeque::with_capacity(state.deferred.len());
            while let Some(entry) = state.deferred.pop_front() {
                let waited = entry.queued_at.elapsed();
                if waited >= timeout {
                    if let Some(client) = state.clients.get_mut(&entry.delta.client_id) {
                        client.predicted.remove(&entry.delta.id);
                    }
                    report.expired.push(ExpiredDelta {
                        delta_id: entry.delta.id,
                        client_id: entry.delta.client_id,
                        waited_ms: waited.as_millis() as u64,
                    });
                } else {
                    kept.push_back(entry);
                }
            }
            state.deferred = kept;
            state.counters.expired += report.expired.len() as u64;
        }

        for expired in &report.expired {
            warn!(
                "Dropped delta {} from {}: causality not resolved within {:?}",
                expired.delta_id, expired.client_id, timeout
            );
            let _ = self.inner.expired_tx.send(expired.clone());
        }
        for applied in &report.applied {
            let _ = self.inner.applied_tx.send(applied.clone());
        }
        report
    }

    /// Starts the causality resolution worker
    ///
    /// The worker wakes whenever the world clock advances, and at least
    /// every poll interval so timeouts are enforced. It stops on its own
    /// once every engine handle has been dropped.
    pub fn spawn_causality_worker(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let poll = self.inner.config.causality_poll_interval();

        tokio::spawn(async move {
            info!("Causality resolution worker started");
            loop {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = inner.clock_advanced.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
                CausalSyncEngine { inner }.resolve_deferred().await;
            }
            debug!("Causality resolution worker stopped");
        })
    }

    /// Deep copy of the whole world
    pub async fn snapshot(&self) -> WorldState {
        self.inner.state.read().await.tree.snapshot()
    }

    /// Deep copy restricted to one world, with its own checksum
    pub async fn snapshot_for_world(&self, world_id: &str) -> WorldState {
        self.inner.state.read().await.tree.snapshot_for_world(world_id)
    }

    /// Registers a client and returns its starting vector clock
    ///
    /// The clock is the world's current clock with the client's own entry
    /// reset to zero. Registering again replaces the previous bookkeeping
    /// and starts a fresh own-counter sequence for duplicate detection.
    pub async fn register_client(&self, client_id: &str, session_id: &str) -> VectorClock {
        let mut state = self.inner.state.write().await;
        let seeded = state.tree.vector_clock().seeded_for(client_id);
        state.applied_counters.remove(client_id);
        state.clients.insert(
            client_id.to_string(),
            ClientState::new(client_id, session_id, seeded.clone()),
        );
        info!("Client {} registered for session {} at {}", client_id, session_id, seeded);
        seeded
    }

    /// Forgets a client's replication bookkeeping
    ///
    /// Returns false when the client was not registered. World state the
    /// client produced stays untouched.
    pub async fn unregister_client(&self, client_id: &str) -> bool {
        let removed = self.inner.state.write().await.clients.remove(client_id).is_some();
        if removed {
            info!("Client {} unregistered", client_id);
        }
        removed
    }

    pub async fn client_state(&self, client_id: &str) -> Option<ClientState> {
        self.inner.state.read().await.clients.get(client_id).cloned()
    }

    /// The server's view of what a client has seen
    pub async fn client_vector_clock(&self, client_id: &str) -> Option<VectorClock> {
        self.inner
            .state
            .read()
            .await
            .clients
            .get(client_id)
            .map(|c| c.vector_clock.clone())
    }

    /// Reconciles a batch of client-predicted deltas
    ///
    /// Each delta goes through the normal apply path. Applied deltas (and
    /// ones that had already been applied) are confirmed; blocked ones stay
    /// predicted until the worker resolves or expires them; the rest are
    /// rejected so the client can roll them back.
    pub async fn sync_client_deltas(&self, client_id: &str, deltas: Vec<Delta>) -> Result<SyncReport, SyncError> {
        {
            let mut state = self.inner.state.write().await;
            let client = state
                .clients
                .get_mut(client_id)
                .ok_or_else(|| SyncError::ClientNotFound {
                    client_id: client_id.to_string(),
                })?;
            for delta in deltas.iter().filter(|d| d.client_id == client_id) {
                client.predicted.insert(delta.id.clone(), delta.clone());
            }
        }

        let mut confirmed = Vec::new();
        let mut deferred = Vec::new();
        let mut rejected = Vec::new();

        for delta in deltas {
            if delta.client_id != client_id {
                rejected.push((
                    delta.id.clone(),
                    SyncError::MalformedPayload {
                        delta_id: delta.id,
                        reason: format!("delta originates from another client, not {}", client_id),
                    },
                ));
                continue;
            }
            let delta_id = delta.id.clone();
            match self.apply_delta(delta.clone()).await {
                Ok(ApplyOutcome::Applied(applied)) => confirmed.push(applied.delta),
                Ok(ApplyOutcome::Deferred { delta_id, .. }) => deferred.push(delta_id),
                // Already known: either applied earlier or still waiting
                Err(SyncError::DuplicateDelta { .. }) => {
                    if self.was_applied(&delta).await {
                        confirmed.push(delta);
                    } else {
                        deferred.push(delta_id);
                    }
                }
                Err(e) => rejected.push((delta_id, e)),
            }
        }

        let mut state = self.inner.state.write().await;
        let world_clock = state.tree.vector_clock().clone();
        let world_version = state.tree.state().version;
        let world_checksum = state.tree.state().checksum.clone();
        let max_log = state.max_log;
        let client = state
            .clients
            .get_mut(client_id)
            .ok_or_else(|| SyncError::ClientNotFound {
                client_id: client_id.to_string(),
            })?;
        for (delta_id, _) in &rejected {
            client.predicted.remove(delta_id);
        }
        for delta in &confirmed {
            if client.predicted.remove(&delta.id).is_some() {
                client.confirmed.push_back(delta.id.clone());
            }
        }
        while client.confirmed.len() > max_log {
            client.confirmed.pop_front();
        }
        client.vector_clock.merge(&world_clock);
        client.last_sync = now_millis();

        Ok(SyncReport {
            confirmed,
            deferred,
            rejected,
            version: world_version,
            checksum: world_checksum,
            vector_clock: client.vector_clock.clone(),
        })
    }

    async fn was_applied(&self, delta: &Delta) -> bool {
        self.inner.state.read().await.was_applied(delta)
    }

    /// Moves an existing avatar, found by exact key or session prefix
    pub async fn update_avatar_position(
        &self,
        lookup: &str,
        position: Vec3,
        rotation: Option<Quat>,
    ) -> Result<AvatarState, SyncError> {
        self.inner
            .state
            .write()
            .await
            .tree
            .update_avatar_position(lookup, position, rotation)
    }

    /// Places an avatar in a world, registering it on first use
    pub async fn update_avatar_position_in_world(
        &self,
        session_id: &str,
        world_id: &str,
        avatar_type: Option<&str>,
        instance_id: Option<&str>,
        position: Vec3,
        rotation: Option<Quat>,
    ) -> AvatarState {
        let key = AvatarKey::new(session_id, Some(world_id), avatar_type, instance_id);
        self.inner
            .state
            .write()
            .await
            .tree
            .update_avatar_position_in_world(key, position, rotation)
    }

    /// Detaches an avatar from its world without removing it
    pub async fn clear_avatar_world(&self, lookup: &str) -> Result<AvatarState, SyncError> {
        self.inner.state.write().await.tree.clear_avatar_world(lookup)
    }

    /// Removes every avatar attached to a world
    pub async fn clear_world(&self, world_id: &str) -> usize {
        self.inner.state.write().await.tree.clear_world(world_id)
    }

    /// Finds an avatar by exact key or key prefix
    pub async fn get_avatar(&self, lookup: &str) -> Option<AvatarState> {
        self.inner.state.read().await.tree.avatar(lookup).cloned()
    }

    /// First avatar of a session, for callers that only know the session id
    pub async fn find_avatar_by_session(&self, session_id: &str) -> Option<AvatarState> {
        let state = self.inner.state.read().await;
        let key = state.tree.registry().keys_for_session(session_id).into_iter().next()?;
        state.tree.avatar(&key.composite()).cloned()
    }

    /// Avatar keys a session currently owns
    pub async fn session_avatars(&self, session_id: &str) -> Vec<AvatarKey> {
        self.inner
            .state
            .read()
            .await
            .tree
            .registry()
            .keys_for_session(session_id)
    }

    pub async fn avatars_in_world(&self, world_id: &str) -> Vec<AvatarState> {
        self.inner.state.read().await.tree.avatars_in_world(world_id)
    }

    pub async fn get_entity(&self, entity_id: &str) -> Option<EntityState> {
        self.inner.state.read().await.tree.entity(entity_id).cloned()
    }

    /// The most recent applied deltas, oldest first
    pub async fn recent_deltas(&self, limit: usize) -> Vec<Delta> {
        let state = self.inner.state.read().await;
        let skip = state.log.len().saturating_sub(limit);
        state.log.iter().skip(skip).cloned().collect()
    }

    /// Number of deltas waiting on causality
    pub async fn deferred_len(&self) -> usize {
        self.inner.state.read().await.deferred.len()
    }

    pub async fn stats(&self) -> EngineStats {
        let state = self.inner.state.read().await;
        let world = state.tree.state();
        EngineStats {
            version: world.version,
            checksum: world.checksum.clone(),
            avatars: world.avatars.len(),
            entities: world.entities.len(),
            clients: state.clients.len(),
            deferred: state.deferred.len(),
            log_len: state.log.len(),
            applied_total: state.counters.applied,
            deferred_total: state.counters.deferred,
            expired_total: state.counters.expired,
            rejected_total: state.counters.rejected,
        }
    }

    /// Every applied delta, including those resolved by the worker
    pub fn subscribe_applied(&self) -> broadcast::Receiver<AppliedDelta> {
        self.inner.applied_tx.subscribe()
    }

    /// Deltas dropped after the causality timeout
    pub fn subscribe_expired(&self) -> broadcast::Receiver<ExpiredDelta> {
        self.inner.expired_tx.subscribe()
    }
}
