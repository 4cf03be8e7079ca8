//! Integration tests for the world synchronization engine
//!
//! These tests exercise the causal engine, the sequence broadcaster and the
//! session hub together, through their public APIs only.

use proptest::prelude::*;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use sync_server::{ApplyOutcome, AvatarKey, CausalSyncEngine, SequenceBroadcaster, SyncConfig, SyncError, SyncHub};
use sync_shared::delta::{AvatarMove, EntityCreate, EntityDelete, EntityUpdate, LightingUpdate, SceneUpdate};
use sync_shared::state::ExtensionMap;
use sync_shared::{ChecksumAlgorithm, Delta, DeltaPayload, Operation, Packet, Vec3, VectorClock, NO_WORLD};

fn clock(entries: &[(&str, u64)]) -> VectorClock {
    entries.iter().map(|(id, c)| (*id, *c)).collect()
}

fn avatar_move(session: &str, world: &str, x: f32) -> DeltaPayload {
    DeltaPayload::AvatarMove(AvatarMove {
        session_id: session.to_string(),
        world_id: Some(world.to_string()),
        avatar_type: None,
        instance_id: None,
        position: Vec3::new(x, 0.0, 0.0),
        rotation: None,
        animation: None,
        metadata: ExtensionMap::new(),
    })
}

fn entity_create(id: &str) -> DeltaPayload {
    DeltaPayload::EntityCreate(EntityCreate {
        id: id.to_string(),
        name: Some(id.to_string()),
        world_id: None,
        position: None,
        rotation: None,
        scale: None,
        components: ExtensionMap::new(),
    })
}

fn entity_update(id: &str, position: Option<Vec3>, components: ExtensionMap) -> DeltaPayload {
    DeltaPayload::EntityUpdate(EntityUpdate {
        id: id.to_string(),
        position,
        rotation: None,
        scale: None,
        components,
    })
}

/// A causally complete history from three clients with cross-client
/// dependencies; concurrent deltas touch disjoint parts of the world
fn causal_history() -> Vec<Delta> {
    let mut hp = ExtensionMap::new();
    hp.insert("hp".to_string(), json!(90));

    vec![
        Delta::new("a-1", "a", clock(&[("a", 1)]), entity_create("a-box")),
        Delta::new("a-2", "a", clock(&[("a", 2)]), avatar_move("sa", "lobby", 1.0)),
        Delta::new("b-1", "b", clock(&[("a", 1), ("b", 1)]), entity_update("a-box", None, hp)),
        Delta::new("b-2", "b", clock(&[("a", 1), ("b", 2)]), avatar_move("sb", "lobby", 2.0)),
        Delta::new(
            "c-1",
            "c",
            clock(&[("a", 1), ("b", 1), ("c", 1)]),
            entity_update("a-box", Some(Vec3::new(4.0, 0.0, 4.0)), ExtensionMap::new()),
        ),
        Delta::new("c-2", "c", clock(&[("a", 1), ("b", 1), ("c", 2)]), entity_create("c-box")),
        Delta::new(
            "c-3",
            "c",
            clock(&[("a", 1), ("b", 1), ("c", 3)]),
            DeltaPayload::SceneUpdate(SceneUpdate {
                lighting: Some(LightingUpdate {
                    ambient_intensity: Some(0.2),
                    ..LightingUpdate::default()
                }),
                physics: None,
                settings: ExtensionMap::new(),
            }),
        ),
        Delta::new(
            "a-3",
            "a",
            clock(&[("a", 3), ("b", 1), ("c", 3)]),
            DeltaPayload::EntityDelete(EntityDelete { id: "c-box".to_string() }),
        ),
    ]
}

/// Originating client of every delta, one label per delta
fn client_labels(history: &[Delta]) -> Vec<String> {
    history.iter().map(|d| d.client_id.clone()).collect()
}

/// Merges per-client queues in the order the labels name them, so each
/// client's own deltas keep their relative order
fn interleave(history: &[Delta], labels: &[String]) -> Vec<Delta> {
    let mut queues: HashMap<&str, VecDeque<Delta>> = HashMap::new();
    for delta in history {
        queues.entry(delta.client_id.as_str()).or_default().push_back(delta.clone());
    }
    labels
        .iter()
        .filter_map(|label| queues.get_mut(label.as_str()).and_then(|q| q.pop_front()))
        .collect()
}

/// Feeds deltas in the given order and lets deferred ones resolve
async fn replay(engine: &CausalSyncEngine, deltas: &[Delta]) {
    for delta in deltas {
        engine.apply_delta(delta.clone()).await.unwrap();
    }
    engine.resolve_deferred().await;
}

/// CAUSAL ENGINE SCENARIOS
mod causal_tests {
    use super::*;

    /// A first delta against an empty world applies immediately
    #[tokio::test]
    async fn first_delta_applies_immediately() {
        let engine = CausalSyncEngine::new(SyncConfig::default());
        let delta = Delta::new("a-1", "a", clock(&[("a", 1)]), avatar_move("sa", "lobby", 1.0));

        let outcome = engine.apply_delta(delta).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(_)));
        assert_eq!(engine.snapshot().await.vector_clock, clock(&[("a", 1)]));
    }

    /// A delta depending on an unseen update waits, then applies exactly once
    #[tokio::test]
    async fn dependent_delta_waits_for_its_cause() {
        let engine = CausalSyncEngine::new(SyncConfig::default());
        let _worker = engine.spawn_causality_worker();

        let dependent = Delta::new("b-1", "b", clock(&[("a", 1), ("b", 1)]), avatar_move("sb", "lobby", 2.0));
        let outcome = engine.apply_delta(dependent.clone()).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Deferred { .. }));
        assert!(engine.get_avatar("sb").await.is_none());

        let cause = Delta::new("a-1", "a", clock(&[("a", 1)]), avatar_move("sa", "lobby", 1.0));
        engine.apply_delta(cause).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while engine.deferred_len().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(engine.get_avatar("sb").await.is_some());
        let stats = engine.stats().await;
        assert_eq!(stats.version, 2);
        assert_eq!(stats.applied_total, 2);

        let err = engine.apply_delta(dependent).await.unwrap_err();
        assert_eq!(err, SyncError::DuplicateDelta { delta_id: "b-1".into() });
    }

    /// A client registering mid-session starts caught up with everyone else
    #[tokio::test]
    async fn late_client_is_seeded_from_world_clock() {
        let engine = CausalSyncEngine::new(SyncConfig::default());
        engine
            .apply_delta(Delta::new("a-1", "a", clock(&[("a", 1)]), avatar_move("sa", "lobby", 0.0)))
            .await
            .unwrap();
        engine
            .apply_delta(Delta::new("b-1", "b", clock(&[("a", 1), ("b", 1)]), avatar_move("sb", "lobby", 0.0)))
            .await
            .unwrap();

        let seeded = engine.register_client("c", "sc").await;
        assert_eq!(seeded, clock(&[("a", 1), ("b", 1), ("c", 0)]));

        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.version, 2);
        assert!(snapshot.verify_checksum(ChecksumAlgorithm::Sha256));

        // The first delta from the new client is immediately ready
        let mut local = seeded;
        let first = Delta::next("c", &mut local, avatar_move("sc", "lobby", 3.0));
        assert!(matches!(engine.apply_delta(first).await.unwrap(), ApplyOutcome::Applied(_)));
    }

    /// A saturated deferred queue fails fast with a retryable error
    #[tokio::test]
    async fn saturated_queue_fails_fast() {
        let engine = CausalSyncEngine::new(SyncConfig {
            max_deferred_deltas: 3,
            ..SyncConfig::default()
        });
        for i in 1..=3 {
            let delta = Delta::new(format!("b-{}", i), "b", clock(&[("a", 9), ("b", i)]), avatar_move("sb", "lobby", 0.0));
            engine.apply_delta(delta).await.unwrap();
        }

        let blocked = Delta::new("b-4", "b", clock(&[("a", 9), ("b", 4)]), avatar_move("sb", "lobby", 0.0));
        let started = std::time::Instant::now();
        let err = engine.apply_delta(blocked).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(matches!(err, SyncError::CausalityViolation { queued: 3, .. }));
        assert!(err.is_retryable());
    }

    /// Snapshots are deep copies
    #[tokio::test]
    async fn snapshot_mutation_does_not_leak() {
        let engine = CausalSyncEngine::new(SyncConfig::default());
        replay(&engine, &causal_history()).await;
        let before = engine.snapshot().await;

        let mut copy = engine.snapshot().await;
        copy.entities.clear();
        copy.scene.lighting.ambient_intensity = 9.0;
        copy.vector_clock.set("z", 100);

        assert_eq!(engine.snapshot().await, before);
    }

    /// Expired deltas are reported and never applied
    #[tokio::test]
    async fn timed_out_delta_is_dropped() {
        let engine = CausalSyncEngine::new(SyncConfig {
            causality_timeout_ms: 30,
            ..SyncConfig::default()
        });
        let mut expired = engine.subscribe_expired();
        let _worker = engine.spawn_causality_worker();

        let orphan = Delta::new("b-1", "b", clock(&[("a", 1), ("b", 1)]), avatar_move("sb", "lobby", 0.0));
        engine.apply_delta(orphan).await.unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(1), expired.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.delta_id, "b-1");
        assert!(notice.waited_ms >= 30);

        // The cause arriving late no longer resurrects the dropped delta
        engine
            .apply_delta(Delta::new("a-1", "a", clock(&[("a", 1)]), avatar_move("sa", "lobby", 0.0)))
            .await
            .unwrap();
        engine.resolve_deferred().await;
        assert!(engine.get_avatar("sb").await.is_none());
    }
}

/// CONVERGENCE PROPERTIES
mod convergence_tests {
    use super::*;

    /// Identical histories in different arrival orders reach the same checksum
    #[tokio::test]
    async fn reversed_arrival_converges() {
        let history = causal_history();
        let mut reversed = history.clone();
        reversed.reverse();

        let forward = CausalSyncEngine::new(SyncConfig::default());
        let backward = CausalSyncEngine::new(SyncConfig::default());
        replay(&forward, &history).await;
        replay(&backward, &reversed).await;

        let a = forward.snapshot().await;
        let b = backward.snapshot().await;
        assert_eq!(backward.deferred_len().await, 0);
        assert_eq!(a.version, history.len() as u64);
        assert_eq!(a.version, b.version);
        assert_eq!(a.checksum, b.checksum);
        assert!(a.entities.contains_key("a-box"));
        assert!(!a.entities.contains_key("c-box"));
    }

    /// Convergence holds with MD5 as well
    #[tokio::test]
    async fn md5_replicas_converge() {
        let config = SyncConfig {
            checksum_algorithm: ChecksumAlgorithm::Md5,
            ..SyncConfig::default()
        };
        let history = causal_history();
        let mut rotated = history.clone();
        rotated.rotate_left(3);

        let first = CausalSyncEngine::new(config.clone());
        let second = CausalSyncEngine::new(config);
        replay(&first, &history).await;
        replay(&second, &rotated).await;

        let a = first.snapshot().await;
        assert_eq!(a.checksum.len(), 32);
        assert_eq!(a.checksum, second.snapshot().await.checksum);
    }

    /// Readiness ignores the originator's own entry, so a client's later
    /// delta arriving first raises the world clock for everyone depending
    /// on its earlier one
    #[tokio::test]
    async fn own_chain_reorder_lets_dependents_through_early() {
        let history = causal_history();
        let engine = CausalSyncEngine::new(SyncConfig::default());

        let outcome = engine.apply_delta(history[1].clone()).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(_)));
        assert_eq!(engine.snapshot().await.vector_clock.get("a"), 2);

        // b-1 depends on a-1, which has not landed, yet it is treated as ready
        let err = engine.apply_delta(history[2].clone()).await.unwrap_err();
        assert_eq!(err, SyncError::UnknownEntity { entity_id: "a-box".into() });
        assert_eq!(engine.deferred_len().await, 0);

        let outcome = engine.apply_delta(history[0].clone()).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(_)));
        assert_eq!(engine.snapshot().await.vector_clock.get("a"), 2);
    }

    #[test]
    fn interleave_keeps_each_client_in_order() {
        let history = causal_history();
        let labels: Vec<String> = ["c", "b", "a", "c", "a", "b", "c", "a"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let merged = interleave(&history, &labels);
        let ids: Vec<&str> = merged.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c-1", "b-1", "a-1", "c-2", "a-2", "b-2", "c-3", "a-3"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn any_interleaving_converges(labels in Just(client_labels(&causal_history())).prop_shuffle()) {
            let history = causal_history();
            let shuffled = interleave(&history, &labels);

            let (reference, permuted) = tokio_test::block_on(async {
                let reference = CausalSyncEngine::new(SyncConfig::default());
                let permuted = CausalSyncEngine::new(SyncConfig::default());
                replay(&reference, &history).await;
                replay(&permuted, &shuffled).await;
                (reference.snapshot().await, permuted.snapshot().await)
            });

            prop_assert_eq!(reference.version, permuted.version);
            prop_assert_eq!(reference.checksum, permuted.checksum);
        }
    }
}

/// SEQUENCE BROADCASTER PROPERTIES
mod broadcast_tests {
    use super::*;

    /// Concurrent submitters get 1, 2, 3 and a reconnecting client replays all
    #[tokio::test]
    async fn concurrent_submissions_replay_in_order() {
        let broadcaster = SequenceBroadcaster::new(&SyncConfig::default());
        let mut handles = Vec::new();
        for client in ["a", "b", "c"] {
            let b = broadcaster.clone();
            handles.push(tokio::spawn(async move {
                b.submit_operation(Operation::new(client, "chat", json!({}))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let missing = broadcaster.get_missing_operations(1, 3).await.unwrap();
        let sequences: Vec<u64> = missing.iter().map(|o| o.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        let mut clients: Vec<&str> = missing.iter().map(|o| o.client_id.as_str()).collect();
        clients.sort_unstable();
        assert_eq!(clients, vec!["a", "b", "c"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn cleanup_never_prunes_unacknowledged(
            acks in proptest::collection::vec(0u64..200, 1..5),
            submissions in 1u64..200,
            retention in 0u64..20,
        ) {
            let (retained, floor, current) = tokio_test::block_on(async {
                let broadcaster = SequenceBroadcaster::new(&SyncConfig {
                    retention_buffer: retention,
                    cleanup_interval: 7,
                    ..SyncConfig::default()
                });
                let mut receivers = Vec::new();
                for i in 0..acks.len() {
                    receivers.push(broadcaster.register_client(&format!("c{}", i)).await);
                }
                for n in 0..submissions {
                    broadcaster.submit_operation(Operation::new("writer", "tick", json!(n))).await;
                    for (i, ack) in acks.iter().enumerate() {
                        if *ack == n {
                            broadcaster.update_client_last_seen(&format!("c{}", i), n).await.unwrap();
                        }
                    }
                }
                let mut min_seen = u64::MAX;
                for i in 0..acks.len() {
                    let seen = broadcaster.get_client_last_seen(&format!("c{}", i)).await.unwrap();
                    min_seen = min_seen.min(seen);
                }
                let retained: Vec<u64> = broadcaster.get_all_operations().await.iter().map(|o| o.sequence).collect();
                (retained, min_seen.saturating_sub(retention), broadcaster.get_current_sequence().await)
            });

            prop_assert_eq!(current, submissions);
            for sequence in floor.max(1)..=current {
                prop_assert!(retained.contains(&sequence), "sequence {} pruned below floor {}", sequence, floor);
            }
            for pair in retained.windows(2) {
                prop_assert_eq!(pair[1], pair[0] + 1);
            }
        }
    }
}

/// AVATAR REGISTRY PROPERTIES
mod avatar_tests {
    use super::*;

    /// Composite keys are deterministic with documented defaults
    #[test]
    fn composite_keys_are_deterministic() {
        let key = AvatarKey::new("s1", Some("lobby"), Some("robot"), Some("3"));
        assert_eq!(key.composite(), AvatarKey::new("s1", Some("lobby"), Some("robot"), Some("3")).composite());
        assert_eq!(AvatarKey::new("s1", Some(""), None, None).composite(), format!("s1:{}:default:0", NO_WORLD));
    }

    /// Switching worlds moves the avatar instead of duplicating it
    #[tokio::test]
    async fn world_switch_keeps_one_avatar() {
        let engine = CausalSyncEngine::new(SyncConfig::default());
        engine
            .update_avatar_position_in_world("s1", "lobby", None, None, Vec3::new(1.0, 0.0, 0.0), None)
            .await;
        engine.clear_avatar_world("s1").await.unwrap();
        engine
            .update_avatar_position_in_world("s1", "arena", None, None, Vec3::new(5.0, 0.0, 0.0), None)
            .await;

        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.avatars.len(), 1);
        assert!(snapshot.avatars.contains_key("s1:arena:default:0"));
        assert!(engine.avatars_in_world("lobby").await.is_empty());

        assert_eq!(engine.clear_world("arena").await, 1);
        assert!(engine.get_avatar("s1").await.is_none());
    }

    /// Lookups by unknown keys report not found
    #[tokio::test]
    async fn unknown_avatar_is_not_found() {
        let engine = CausalSyncEngine::new(SyncConfig::default());
        let err = engine.update_avatar_position("ghost", Vec3::ZERO, None).await.unwrap_err();
        assert_eq!(err, SyncError::AvatarNotFound { key: "ghost".into() });
    }
}

/// HUB AND WIRE PROTOCOL TESTS
mod hub_tests {
    use super::*;

    /// Two clients over JSON frames see each other's deltas and operations
    #[tokio::test]
    async fn two_clients_over_json_frames() {
        let (hub, mut outbound) = SyncHub::new(SyncConfig::default());

        for (client, session) in [("a", "sa"), ("b", "sb")] {
            let frame = Packet::Connect {
                client_id: client.into(),
                session_id: session.into(),
            }
            .encode()
            .unwrap();
            let replies = hub.handle_packet(client, Packet::decode(&frame).unwrap()).await;
            assert!(matches!(replies[0].packet(), Packet::Connected { .. }));
        }

        let mut local = VectorClock::new();
        let delta = Delta::next("a", &mut local, avatar_move("sa", "lobby", 1.5))
            .seal(ChecksumAlgorithm::Sha256)
            .to_wire()
            .unwrap();
        let frame = Packet::SubmitDelta { delta }.encode().unwrap();
        let replies = hub.handle_packet("a", Packet::decode(&frame).unwrap()).await;
        assert!(replies[0].is_for("b"));
        let echoed = Packet::decode(&replies[0].packet().encode().unwrap()).unwrap();
        match echoed {
            Packet::DeltaApplied { delta, version, checksum } => {
                assert_eq!(delta.id, "a-1");
                assert_eq!(version, 1);
                assert_eq!(checksum, hub.engine().snapshot().await.checksum);
            }
            other => panic!("Expected DeltaApplied, got {:?}", other),
        }

        hub.handle_packet(
            "b",
            Packet::SubmitOperation {
                op_type: "emote".into(),
                payload: json!({ "name": "wave" }),
            },
        )
        .await;
        let mut delivered = 0;
        while delivered < 2 {
            let message = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(message.packet(), Packet::OperationBroadcast { .. }) {
                delivered += 1;
            }
        }
    }

    /// Tampered deltas are rejected with a non-retryable reason
    #[tokio::test]
    async fn tampered_delta_is_rejected() {
        let (hub, _outbound) = SyncHub::new(SyncConfig::default());
        hub.handle_packet(
            "a",
            Packet::Connect {
                client_id: "a".into(),
                session_id: "sa".into(),
            },
        )
        .await;

        let mut local = VectorClock::new();
        let mut delta = Delta::next("a", &mut local, avatar_move("sa", "lobby", 1.0))
            .seal(ChecksumAlgorithm::Sha256)
            .to_wire()
            .unwrap();
        delta.data["position"]["x"] = json!(99.0);

        let replies = hub.handle_packet("a", Packet::SubmitDelta { delta }).await;
        match replies[0].packet() {
            Packet::DeltaRejected { rejection } => {
                assert!(rejection.reason.contains("integrity"));
                assert!(!rejection.retryable);
            }
            other => panic!("Expected DeltaRejected, got {:?}", other),
        }
        assert_eq!(hub.engine().stats().await.version, 0);
    }
}
