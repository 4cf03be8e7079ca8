//! Session hub connecting client packets to the two synchronization layers
//!
//! The hub does not own sockets. A transport decodes frames into
//! [`Packet`]s, hands them to [`SyncHub::handle_packet`] together with the
//! connection's client id, and delivers the returned [`HubMessage`]s. The
//! same messages are produced asynchronously by the hub's background tasks
//! (operation fan-out, periodic state digests, deltas resolved by the
//! causality worker and expiry notices) on the channel returned by
//! [`SyncHub::new`].

use crate::broadcast::SequenceBroadcaster;
use crate::causal::{ApplyOutcome, CausalSyncEngine};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::registry::AvatarKey;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use sync_shared::{Delta, Operation, Packet, Rejection, Vec3, WireDelta};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Outbound traffic for the transport to deliver
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    SendPacket {
        client_id: String,
        packet: Packet,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<String>,
    },
}

impl HubMessage {
    fn reply(client_id: &str, packet: Packet) -> Self {
        HubMessage::SendPacket {
            client_id: client_id.to_string(),
            packet,
        }
    }

    /// True if the transport should deliver this message to `client_id`
    pub fn is_for(&self, client_id: &str) -> bool {
        match self {
            HubMessage::SendPacket { client_id: target, .. } => target == client_id,
            HubMessage::BroadcastPacket { exclude, .. } => exclude.as_deref() != Some(client_id),
        }
    }

    /// The packet to deliver
    pub fn packet(&self) -> &Packet {
        match self {
            HubMessage::SendPacket { packet, .. } | HubMessage::BroadcastPacket { packet, .. } => packet,
        }
    }
}

/// A connected client
struct Session {
    session_id: String,
    world_id: Option<String>,
    /// Forwards the client's operation queue onto the outbound channel
    forwarder: JoinHandle<()>,
}

/// Session layer between a transport and the two synchronization layers
///
/// Clones share the same sessions and outbound channel.
#[derive(Clone)]
pub struct SyncHub {
    engine: CausalSyncEngine,
    broadcaster: SequenceBroadcaster,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    outbound_tx: mpsc::UnboundedSender<HubMessage>,
}

impl SyncHub {
    /// Builds a hub over fresh engine and broadcaster instances
    pub fn new(config: SyncConfig) -> (Self, mpsc::UnboundedReceiver<HubMessage>) {
        let broadcaster = SequenceBroadcaster::new(&config);
        let engine = CausalSyncEngine::new(config);
        Self::with_layers(engine, broadcaster)
    }

    /// Builds a hub over existing layers, e.g. to share an engine in tests
    pub fn with_layers(
        engine: CausalSyncEngine,
        broadcaster: SequenceBroadcaster,
    ) -> (Self, mpsc::UnboundedReceiver<HubMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let hub = Self {
            engine,
            broadcaster,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            outbound_tx,
        };
        (hub, outbound_rx)
    }

    pub fn engine(&self) -> &CausalSyncEngine {
        &self.engine
    }

    pub fn broadcaster(&self) -> &SequenceBroadcaster {
        &self.broadcaster
    }

    /// Number of connected clients
    pub async fn connected_clients(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Starts the causality worker and the hub's background tasks
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.engine.spawn_causality_worker(),
            self.spawn_state_digest(),
            self.spawn_engine_events(),
        ]
    }

    /// Pushes the world version and checksum to every client periodically
    ///
    /// Clients compare the digest with their own replica to detect drift and
    /// request a snapshot when they disagree.
    pub fn spawn_state_digest(&self) -> JoinHandle<()> {
        let hub = self.clone();
        let period = self.engine.config().sync_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if hub.sessions.read().await.is_empty() {
                    continue;
                }
                let stats = hub.engine.stats().await;
                debug!("State digest: version {} checksum {}", stats.version, stats.checksum);
                let packet = Packet::StateDigest {
                    version: stats.version,
                    checksum: stats.checksum,
                };
                if hub.send(HubMessage::BroadcastPacket { packet, exclude: None }).is_err() {
                    break;
                }
            }
        })
    }

    /// Relays engine events that happen outside any request
    ///
    /// Deltas applied by the causality worker are broadcast like directly
    /// applied ones, and expired deltas are reported to their originator.
    pub fn spawn_engine_events(&self) -> JoinHandle<()> {
        let hub = self.clone();
        let mut applied_rx = self.engine.subscribe_applied();
        let mut expired_rx = self.engine.subscribe_expired();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    applied = applied_rx.recv() => match applied {
                        Ok(applied) if applied.deferred => HubMessage::BroadcastPacket {
                            packet: Packet::DeltaApplied {
                                delta: applied.delta,
                                version: applied.version,
                                checksum: applied.checksum,
                            },
                            exclude: None,
                        },
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            error!("Hub lagged behind engine, {} applied deltas not relayed", missed);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    expired = expired_rx.recv() => match expired {
                        Ok(expired) => HubMessage::SendPacket {
                            client_id: expired.client_id,
                            packet: Packet::DeltaExpired { delta_id: expired.delta_id },
                        },
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            error!("Hub lagged behind engine, {} expiry notices not relayed", missed);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if hub.send(message).is_err() {
                    break;
                }
            }
        })
    }

    fn send(&self, message: HubMessage) -> Result<(), ()> {
        self.outbound_tx.send(message).map_err(|e| {
            error!("Failed to queue outbound message: {}", e);
        })
    }

    /// Processes one packet from `client_id` and returns the immediate
    /// replies and broadcasts
    pub async fn handle_packet(&self, client_id: &str, packet: Packet) -> Vec<HubMessage> {
        if let Packet::Connect { client_id: requested, session_id } = packet {
            if requested != client_id {
                return vec![HubMessage::reply(
                    client_id,
                    Packet::Error {
                        message: format!("connection belongs to '{}', not '{}'", client_id, requested),
                    },
                )];
            }
            return self.connect(client_id, &session_id).await;
        }

        let session = self
            .sessions
            .read()
            .await
            .get(client_id)
            .map(|s| (s.session_id.clone(), s.world_id.clone()));
        let Some((session_id, world_id)) = session else {
            warn!("Packet from unknown client {}", client_id);
            return vec![HubMessage::reply(
                client_id,
                Packet::Error {
                    message: "not connected".to_string(),
                },
            )];
        };

        match packet {
            Packet::JoinWorld {
                world_id: target,
                avatar_type,
                instance_id,
                position,
            } => {
                let avatar = self
                    .engine
                    .update_avatar_position_in_world(
                        &session_id,
                        &target,
                        avatar_type.as_deref(),
                        instance_id.as_deref(),
                        position.unwrap_or(Vec3::ZERO),
                        None,
                    )
                    .await;
                if let Some(session) = self.sessions.write().await.get_mut(client_id) {
                    session.world_id = Some(target.clone());
                }
                info!(
                    "Client {} joined world {} as {}:{}",
                    client_id, target, avatar.avatar_type, avatar.instance_id
                );
                vec![HubMessage::reply(
                    client_id,
                    Packet::Snapshot {
                        state: self.engine.snapshot_for_world(&target).await,
                    },
                )]
            }

            Packet::LeaveWorld {
                avatar_type,
                instance_id,
            } => {
                let key = AvatarKey::new(
                    &session_id,
                    world_id.as_deref(),
                    avatar_type.as_deref(),
                    instance_id.as_deref(),
                );
                match self.engine.clear_avatar_world(&key.composite()).await {
                    Ok(_) => {
                        if let Some(session) = self.sessions.write().await.get_mut(client_id) {
                            session.world_id = None;
                        }
                        vec![HubMessage::reply(client_id, self.digest().await)]
                    }
                    Err(e) => vec![error_reply(client_id, &e)],
                }
            }

            Packet::SubmitDelta { delta } => self.submit_delta(client_id, delta).await,

            Packet::SyncDeltas { deltas } => self.sync_deltas(client_id, deltas).await,

            Packet::SubmitOperation { op_type, payload } => {
                let operation = self
                    .broadcaster
                    .submit_operation(Operation::new(client_id, op_type, payload))
                    .await;
                debug!("Client {} submitted operation {}", client_id, operation.sequence);
                Vec::new()
            }

            Packet::Ack { sequence } => match self.broadcaster.update_client_last_seen(client_id, sequence).await {
                Ok(_) => Vec::new(),
                Err(e) => vec![error_reply(client_id, &e)],
            },

            Packet::RequestMissing { from, to } => {
                match self.broadcaster.get_missing_operations(from, to).await {
                    Ok(operations) => vec![HubMessage::reply(client_id, Packet::Operations { operations })],
                    Err(e) => vec![error_reply(client_id, &e)],
                }
            }

            Packet::RequestSnapshot { world_id: requested } => {
                let state = match requested.or(world_id) {
                    Some(world) => self.engine.snapshot_for_world(&world).await,
                    None => self.engine.snapshot().await,
                };
                vec![HubMessage::reply(client_id, Packet::Snapshot { state })]
            }

            Packet::Disconnect => {
                self.disconnect(client_id).await;
                vec![HubMessage::reply(
                    client_id,
                    Packet::Disconnected {
                        reason: "client requested disconnect".to_string(),
                    },
                )]
            }

            other => {
                warn!("Unexpected packet type from client {}: {:?}", client_id, other);
                Vec::new()
            }
        }
    }

    async fn connect(&self, client_id: &str, session_id: &str) -> Vec<HubMessage> {
        if self.sessions.read().await.contains_key(client_id) {
            info!("Replacing existing connection for client {}", client_id);
            self.disconnect(client_id).await;
        }

        let vector_clock = self.engine.register_client(client_id, session_id).await;
        let mut operations = self.broadcaster.register_client(client_id).await;
        let current_sequence = self.broadcaster.get_current_sequence().await;

        let outbound_tx = self.outbound_tx.clone();
        let target = client_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(operation) = operations.recv().await {
                let message = HubMessage::SendPacket {
                    client_id: target.clone(),
                    packet: Packet::OperationBroadcast { operation },
                };
                if outbound_tx.send(message).is_err() {
                    break;
                }
            }
        });

        self.sessions.write().await.insert(
            client_id.to_string(),
            Session {
                session_id: session_id.to_string(),
                world_id: None,
                forwarder,
            },
        );

        vec![HubMessage::reply(
            client_id,
            Packet::Connected {
                client_id: client_id.to_string(),
                vector_clock,
                current_sequence,
                snapshot: self.engine.snapshot().await,
            },
        )]
    }

    /// Drops a client from both layers; its avatars stay in the world
    pub async fn disconnect(&self, client_id: &str) -> bool {
        let Some(session) = self.sessions.write().await.remove(client_id) else {
            return false;
        };
        session.forwarder.abort();
        self.engine.unregister_client(client_id).await;
        self.broadcaster.unregister_client(client_id).await;
        info!("Client {} (session {}) disconnected", client_id, session.session_id);
        true
    }

    async fn submit_delta(&self, client_id: &str, wire: WireDelta) -> Vec<HubMessage> {
        let delta = match self.decode_delta(client_id, wire) {
            Ok(delta) => delta,
            Err(rejection) => return vec![HubMessage::reply(client_id, Packet::DeltaRejected { rejection })],
        };
        let delta_id = delta.id.clone();

        match self.engine.apply_delta(delta).await {
            Ok(ApplyOutcome::Applied(applied)) => vec![HubMessage::BroadcastPacket {
                packet: Packet::DeltaApplied {
                    delta: applied.delta,
                    version: applied.version,
                    checksum: applied.checksum,
                },
                exclude: None,
            }],
            Ok(ApplyOutcome::Deferred { delta_id, queued }) => {
                vec![HubMessage::reply(client_id, Packet::DeltaQueued { delta_id, queued })]
            }
            Err(e) => vec![HubMessage::reply(
                client_id,
                Packet::DeltaRejected {
                    rejection: e.to_rejection(&delta_id),
                },
            )],
        }
    }

    async fn sync_deltas(&self, client_id: &str, wire: Vec<WireDelta>) -> Vec<HubMessage> {
        let mut rejected = Vec::new();
        let mut deltas = Vec::with_capacity(wire.len());
        for wire_delta in wire {
            match self.decode_delta(client_id, wire_delta) {
                Ok(delta) => deltas.push(delta),
                Err(rejection) => rejected.push(rejection),
            }
        }

        let report = match self.engine.sync_client_deltas(client_id, deltas).await {
            Ok(report) => report,
            Err(e) => return vec![error_reply(client_id, &e)],
        };
        rejected.extend(report.rejected.iter().map(|(id, e)| e.to_rejection(id)));

        let mut messages: Vec<HubMessage> = report
            .confirmed
            .iter()
            .map(|delta| HubMessage::BroadcastPacket {
                packet: Packet::DeltaApplied {
                    delta: delta.clone(),
                    version: report.version,
                    checksum: report.checksum.clone(),
                },
                exclude: Some(client_id.to_string()),
            })
            .collect();
        messages.push(HubMessage::reply(
            client_id,
            Packet::SyncResult {
                confirmed: report.confirmed,
                deferred: report.deferred,
                rejected,
                version: report.version,
                checksum: report.checksum,
            },
        ));
        messages
    }

    /// Converts a wire delta, refusing ones that claim another origin
    fn decode_delta(&self, client_id: &str, wire: WireDelta) -> Result<Delta, Rejection> {
        let delta_id = wire.id.clone();
        if wire.client_id != client_id {
            let err = SyncError::MalformedPayload {
                delta_id: delta_id.clone(),
                reason: format!("delta claims client '{}'", wire.client_id),
            };
            return Err(err.to_rejection(&delta_id));
        }
        Delta::try_from(wire).map_err(|e| SyncError::malformed(&delta_id, e).to_rejection(&delta_id))
    }

    async fn digest(&self) -> Packet {
        let stats = self.engine.stats().await;
        Packet::StateDigest {
            version: stats.version,
            checksum: stats.checksum,
        }
    }
}

fn error_reply(client_id: &str, err: &SyncError) -> HubMessage {
    HubMessage::reply(
        client_id,
        Packet::Error {
            message: err.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use sync_shared::delta::AvatarMove;
    use sync_shared::state::ExtensionMap;
    use sync_shared::{DeltaPayload, VectorClock};

    fn hub() -> (SyncHub, mpsc::UnboundedReceiver<HubMessage>) {
        SyncHub::new(SyncConfig::default())
    }

    async fn connect(hub: &SyncHub, client: &str, session: &str) -> VectorClock {
        let replies = hub
            .handle_packet(
                client,
                Packet::Connect {
                    client_id: client.to_string(),
                    session_id: session.to_string(),
                },
            )
            .await;
        match replies[0].packet() {
            Packet::Connected { vector_clock, .. } => vector_clock.clone(),
            other => panic!("Expected Connected, got {:?}", other),
        }
    }

    fn move_delta(client: &str, clock: &mut VectorClock, session: &str, x: f32) -> WireDelta {
        let payload = DeltaPayload::AvatarMove(AvatarMove {
            session_id: session.to_string(),
            world_id: Some("lobby".to_string()),
            avatar_type: None,
            instance_id: None,
            position: Vec3::new(x, 0.0, 0.0),
            rotation: None,
            animation: None,
            metadata: ExtensionMap::new(),
        });
        Delta::next(client, clock, payload).to_wire().unwrap()
    }

    #[tokio::test]
    async fn test_packets_require_connection() {
        let (hub, _rx) = hub();
        let replies = hub.handle_packet("a", Packet::Ack { sequence: 1 }).await;
        assert_eq!(
            replies,
            vec![HubMessage::reply("a", Packet::Error { message: "not connected".into() })]
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_mismatched_id() {
        let (hub, _rx) = hub();
        let replies = hub
            .handle_packet(
                "a",
                Packet::Connect {
                    client_id: "b".into(),
                    session_id: "s".into(),
                },
            )
            .await;
        assert!(matches!(replies[0].packet(), Packet::Error { .. }));
        assert_eq!(hub.connected_clients().await, 0);
    }

    #[tokio::test]
    async fn test_submit_delta_broadcasts_applied() {
        let (hub, _rx) = hub();
        let mut clock = connect(&hub, "a", "s1").await;

        let replies = hub
            .handle_packet("a", Packet::SubmitDelta { delta: move_delta("a", &mut clock, "s1", 3.0) })
            .await;

        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_for("a"));
        assert!(replies[0].is_for("b"));
        match replies[0].packet() {
            Packet::DeltaApplied { delta, version, .. } => {
                assert_eq!(delta.id, "a-1");
                assert_eq!(*version, 1);
            }
            other => panic!("Expected DeltaApplied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocked_delta_is_queued_then_relayed() {
        let (hub, mut rx) = hub();
        let _tasks = hub.start();
        let mut clock_a = connect(&hub, "a", "s1").await;
        let mut clock_b = connect(&hub, "b", "s2").await;

        let first = move_delta("a", &mut clock_a, "s1", 1.0);
        clock_b.merge(&first.vector_clock);
        let dependent = move_delta("b", &mut clock_b, "s2", 2.0);

        let replies = hub.handle_packet("b", Packet::SubmitDelta { delta: dependent }).await;
        assert!(matches!(replies[0].packet(), Packet::DeltaQueued { queued: 1, .. }));

        hub.handle_packet("a", Packet::SubmitDelta { delta: first }).await;

        let relayed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match rx.recv().await {
                    Some(HubMessage::BroadcastPacket {
                        packet: Packet::DeltaApplied { delta, .. },
                        ..
                    }) => return delta,
                    Some(_) => continue,
                    None => panic!("outbound channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(relayed.id, "b-1");
    }

    #[tokio::test]
    async fn test_delta_for_other_client_is_rejected() {
        let (hub, _rx) = hub();
        connect(&hub, "a", "s1").await;
        let mut clock = VectorClock::new();
        let forged = move_delta("b", &mut clock, "s1", 1.0);

        let replies = hub.handle_packet("a", Packet::SubmitDelta { delta: forged }).await;
        match replies[0].packet() {
            Packet::DeltaRejected { rejection } => {
                assert_eq!(rejection.delta_id, "b-1");
                assert!(!rejection.retryable);
            }
            other => panic!("Expected DeltaRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sync_deltas_reports_and_broadcasts() {
        let (hub, _rx) = hub();
        let mut clock = connect(&hub, "a", "s1").await;
        let deltas = vec![
            move_delta("a", &mut clock, "s1", 1.0),
            move_delta("a", &mut clock, "s1", 2.0),
        ];

        let replies = hub.handle_packet("a", Packet::SyncDeltas { deltas }).await;
        assert_eq!(replies.len(), 3);
        assert!(!replies[0].is_for("a"));
        match replies[2].packet() {
            Packet::SyncResult { confirmed, rejected, version, .. } => {
                assert_eq!(confirmed.len(), 2);
                assert!(rejected.is_empty());
                assert_eq!(*version, 2);
            }
            other => panic!("Expected SyncResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_operations_fan_out_and_replay() {
        let (hub, mut rx) = hub();
        connect(&hub, "a", "s1").await;
        connect(&hub, "b", "s2").await;

        hub.handle_packet(
            "a",
            Packet::SubmitOperation {
                op_type: "chat".into(),
                payload: json!({ "text": "hi" }),
            },
        )
        .await;

        let mut recipients = Vec::new();
        for _ in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let HubMessage::SendPacket {
                client_id,
                packet: Packet::OperationBroadcast { operation },
            } = message
            {
                assert_eq!(operation.sequence, 1);
                recipients.push(client_id);
            }
        }
        recipients.sort();
        assert_eq!(recipients, vec!["a".to_string(), "b".to_string()]);

        let replies = hub.handle_packet("b", Packet::RequestMissing { from: 1, to: 1 }).await;
        match replies[0].packet() {
            Packet::Operations { operations } => assert_eq!(operations.len(), 1),
            other => panic!("Expected Operations, got {:?}", other),
        }

        let replies = hub.handle_packet("b", Packet::RequestMissing { from: 3, to: 1 }).await;
        assert!(matches!(replies[0].packet(), Packet::Error { .. }));
    }

    #[tokio::test]
    async fn test_join_and_leave_world() {
        let (hub, _rx) = hub();
        connect(&hub, "a", "s1").await;

        let replies = hub
            .handle_packet(
                "a",
                Packet::JoinWorld {
                    world_id: "lobby".into(),
                    avatar_type: None,
                    instance_id: None,
                    position: Some(Vec3::new(1.0, 2.0, 3.0)),
                },
            )
            .await;
        match replies[0].packet() {
            Packet::Snapshot { state } => assert_eq!(state.avatars.len(), 1),
            other => panic!("Expected Snapshot, got {:?}", other),
        }

        let replies = hub
            .handle_packet("a", Packet::LeaveWorld { avatar_type: None, instance_id: None })
            .await;
        assert!(matches!(replies[0].packet(), Packet::StateDigest { .. }));
        assert!(hub.engine().avatars_in_world("lobby").await.is_empty());
        assert!(hub.engine().get_avatar("s1").await.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_everywhere() {
        let (hub, _rx) = hub();
        connect(&hub, "a", "s1").await;

        let replies = hub.handle_packet("a", Packet::Disconnect).await;
        assert!(matches!(replies[0].packet(), Packet::Disconnected { .. }));
        assert_eq!(hub.connected_clients().await, 0);
        assert!(hub.engine().client_vector_clock("a").await.is_none());
        assert_eq!(hub.broadcaster().get_client_last_seen("a").await, None);
        assert!(!hub.disconnect("a").await);
    }

    #[tokio::test]
    async fn test_expired_delta_is_reported_to_origin() {
        let (hub, mut rx) = SyncHub::new(SyncConfig {
            causality_timeout_ms: 20,
            ..SyncConfig::default()
        });
        let _tasks = hub.start();
        connect(&hub, "b", "s2").await;

        let mut clock: VectorClock = [("a", 5u64)].into_iter().collect();
        let blocked = move_delta("b", &mut clock, "s2", 1.0);
        hub.handle_packet("b", Packet::SubmitDelta { delta: blocked }).await;

        let expired = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Some(HubMessage::SendPacket {
                        client_id,
                        packet: Packet::DeltaExpired { delta_id },
                    }) => return (client_id, delta_id),
                    Some(_) => continue,
                    None => panic!("outbound channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(expired, ("b".to_string(), "b-1".to_string()));
    }
}
