use clap::Parser;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sync_server::{HubMessage, SyncConfig, SyncHub};
use sync_shared::delta::{AvatarMove, EntityCreate, EntityUpdate};
use sync_shared::state::ExtensionMap;
use sync_shared::{ChecksumAlgorithm, Delta, DeltaPayload, Packet, Quat, Vec3, VectorClock, WireDelta};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

/// Drives simulated clients against an in-process world sync hub
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of simulated clients
    #[arg(short, long, default_value_t = 4)]
    clients: usize,

    /// Number of simulation ticks to run
    #[arg(short, long, default_value_t = 300)]
    ticks: u64,

    /// Ticks per second
    #[arg(long, default_value_t = 30)]
    tick_rate: u32,

    /// Chance that a delta is held back and delivered one tick late
    #[arg(long, default_value_t = 0.1)]
    reorder_chance: f64,

    /// RNG seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// World every simulated avatar joins
    #[arg(long, default_value = "lobby")]
    world: String,

    #[command(flatten)]
    sync: SyncConfig,
}

/// One simulated client with its local causal view
struct SimClient {
    id: String,
    session: String,
    clock: VectorClock,
    position: Vec3,
    entities: Vec<String>,
}

#[derive(Default)]
struct Delivered {
    total: AtomicU64,
    applied: AtomicU64,
    expired: AtomicU64,
    operations: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    args.sync.validate()?;
    let seed = args.seed.unwrap_or_else(rand::random);
    info!(
        "Simulating {} clients for {} ticks at {}Hz (seed {}, checksum {})",
        args.clients, args.ticks, args.tick_rate, seed, args.sync.checksum_algorithm
    );

    let (hub, outbound) = SyncHub::new(args.sync.clone());
    let tasks = hub.start();
    let delivered = Arc::new(Delivered::default());
    let drain = tokio::spawn(drain_outbound(outbound, Arc::clone(&delivered)));

    tokio::select! {
        result = run_simulation(&hub, &args, seed) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping simulation");
        }
    }

    settle(&hub, args.sync.causality_timeout()).await;
    report(&hub, &delivered, args.sync.checksum_algorithm).await;

    for task in tasks {
        task.abort();
    }
    drain.abort();
    Ok(())
}

async fn run_simulation(hub: &SyncHub, args: &Args, seed: u64) -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let algorithm = args.sync.checksum_algorithm;
    let mut clients = Vec::with_capacity(args.clients);

    for i in 0..args.clients {
        let id = format!("client-{}", i + 1);
        let session = format!("session-{}", i + 1);
        let replies = send(hub, &id, Packet::Connect { client_id: id.clone(), session_id: session.clone() }).await?;
        let clock = match replies.first().map(HubMessage::packet) {
            Some(Packet::Connected { vector_clock, .. }) => vector_clock.clone(),
            other => return Err(format!("unexpected connect reply for {}: {:?}", id, other).into()),
        };

        let position = Vec3::new(rng.gen_range(-10.0..10.0), 0.0, rng.gen_range(-10.0..10.0));
        send(
            hub,
            &id,
            Packet::JoinWorld {
                world_id: args.world.clone(),
                avatar_type: None,
                instance_id: None,
                position: Some(position),
            },
        )
        .await?;
        clients.push(SimClient { id, session, clock, position, entities: Vec::new() });
    }

    let mut ticker = interval(Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut held_back: Vec<(String, WireDelta)> = Vec::new();

    for tick in 0..args.ticks {
        ticker.tick().await;

        for (client_id, delta) in std::mem::take(&mut held_back) {
            send(hub, &client_id, Packet::SubmitDelta { delta }).await?;
        }

        for index in 0..clients.len() {
            let roll: f64 = rng.gen();
            if roll < 0.1 {
                let client = &clients[index];
                let payload = json!({ "tick": tick, "text": format!("hello from {}", client.id) });
                send(hub, &client.id, Packet::SubmitOperation { op_type: "chat".to_string(), payload }).await?;
                continue;
            }

            let payload = next_payload(&mut clients[index], &args.world, roll, &mut rng);
            let client = &mut clients[index];
            let delta = Delta::next(&client.id, &mut client.clock, payload).seal(algorithm).to_wire()?;

            if clients.len() > 1 && rng.gen_bool(args.reorder_chance.clamp(0.0, 1.0)) {
                // Another client learns of the delta before the hub does, so
                // its next delta depends on one the hub has not seen yet
                let mut peer = rng.gen_range(0..clients.len() - 1);
                if peer >= index {
                    peer += 1;
                }
                clients[peer].clock.merge(&delta.vector_clock);
                held_back.push((clients[index].id.clone(), delta));
                continue;
            }

            send(hub, &clients[index].id, Packet::SubmitDelta { delta }).await?;
        }

        for client in &clients {
            let sequence = hub.broadcaster().get_current_sequence().await;
            send(hub, &client.id, Packet::Ack { sequence }).await?;
        }

        if tick % 60 == 0 {
            let stats = hub.engine().stats().await;
            debug!(
                "Tick {}: version {}, {} deferred, {} applied, {} expired",
                tick, stats.version, stats.deferred, stats.applied_total, stats.expired_total
            );
        }
    }

    for (client_id, delta) in held_back {
        send(hub, &client_id, Packet::SubmitDelta { delta }).await?;
    }
    for client in &clients {
        send(hub, &client.id, Packet::Disconnect).await?;
    }
    Ok(())
}

fn next_payload(client: &mut SimClient, world: &str, roll: f64, rng: &mut StdRng) -> DeltaPayload {
    if roll < 0.2 || (roll < 0.35 && client.entities.is_empty()) {
        let id = format!("{}-crate-{}", client.id, client.entities.len() + 1);
        client.entities.push(id.clone());
        let mut components = ExtensionMap::new();
        components.insert("owner".to_string(), json!(client.id));
        return DeltaPayload::EntityCreate(EntityCreate {
            id,
            name: Some("crate".to_string()),
            world_id: Some(world.to_string()),
            position: Some(Vec3::new(rng.gen_range(-20.0..20.0), 0.0, rng.gen_range(-20.0..20.0))),
            rotation: None,
            scale: None,
            components,
        });
    }

    if roll < 0.35 {
        let id = client.entities[rng.gen_range(0..client.entities.len())].clone();
        let mut components = ExtensionMap::new();
        components.insert("hp".to_string(), json!(rng.gen_range(0..100u32)));
        return DeltaPayload::EntityUpdate(EntityUpdate {
            id,
            position: Some(Vec3::new(rng.gen_range(-20.0..20.0), 0.0, rng.gen_range(-20.0..20.0))),
            rotation: None,
            scale: None,
            components,
        });
    }

    client.position.x += rng.gen_range(-1.0..1.0);
    client.position.z += rng.gen_range(-1.0..1.0);
    let yaw: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
    DeltaPayload::AvatarMove(AvatarMove {
        session_id: client.session.clone(),
        world_id: Some(world.to_string()),
        avatar_type: None,
        instance_id: None,
        position: client.position,
        rotation: Some(Quat::new(0.0, (yaw / 2.0).sin(), 0.0, (yaw / 2.0).cos())),
        animation: Some("walk".to_string()),
        metadata: ExtensionMap::new(),
    })
}

/// Sends a packet through the JSON codec, as a transport would
async fn send(hub: &SyncHub, client_id: &str, packet: Packet) -> Result<Vec<HubMessage>, Box<dyn std::error::Error>> {
    let frame = packet.encode()?;
    let packet = Packet::decode(&frame)?;
    let replies = hub.handle_packet(client_id, packet).await;
    for reply in &replies {
        match reply.packet() {
            Packet::DeltaRejected { rejection } => warn!(
                "Delta {} from {} rejected: {}",
                rejection.delta_id, client_id, rejection.reason
            ),
            Packet::Error { message } => warn!("Hub error for {}: {}", client_id, message),
            _ => {}
        }
    }
    Ok(replies)
}

async fn drain_outbound(mut outbound: mpsc::UnboundedReceiver<HubMessage>, delivered: Arc<Delivered>) {
    while let Some(message) = outbound.recv().await {
        delivered.total.fetch_add(1, Ordering::Relaxed);
        match message.packet() {
            Packet::DeltaApplied { .. } => {
                delivered.applied.fetch_add(1, Ordering::Relaxed);
            }
            Packet::DeltaExpired { delta_id } => {
                delivered.expired.fetch_add(1, Ordering::Relaxed);
                debug!("Expiry notice for {}", delta_id);
            }
            Packet::OperationBroadcast { .. } => {
                delivered.operations.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Waits for the causality worker to drain the deferred queue
async fn settle(hub: &SyncHub, timeout: Duration) {
    let deadline = Instant::now() + timeout + Duration::from_millis(100);
    while hub.engine().deferred_len().await > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn report(hub: &SyncHub, delivered: &Delivered, algorithm: ChecksumAlgorithm) {
    let stats = hub.engine().stats().await;
    let broadcast = hub.broadcaster().get_stats().await;
    let snapshot = hub.engine().snapshot().await;

    let mut per_world: BTreeMap<String, usize> = BTreeMap::new();
    for avatar in snapshot.avatars.values() {
        let world = avatar.world_id.clone().unwrap_or_else(|| "<none>".to_string());
        *per_world.entry(world).or_default() += 1;
    }

    info!(
        "World version {}: {} avatars {:?}, {} entities, clock {}",
        stats.version, stats.avatars, per_world, stats.entities, snapshot.vector_clock
    );
    info!(
        "Deltas: {} applied, {} deferred at some point, {} expired, {} rejected, {} still waiting",
        stats.applied_total, stats.deferred_total, stats.expired_total, stats.rejected_total, stats.deferred
    );
    info!(
        "Operations: sequence {}, {} retained, {} pruned, {} dropped deliveries",
        broadcast.current_sequence, broadcast.retained, broadcast.total_pruned, broadcast.total_dropped
    );
    info!(
        "Outbound: {} messages ({} delta broadcasts, {} operation deliveries, {} expiry notices)",
        delivered.total.load(Ordering::Relaxed),
        delivered.applied.load(Ordering::Relaxed),
        delivered.operations.load(Ordering::Relaxed),
        delivered.expired.load(Ordering::Relaxed)
    );

    if snapshot.verify_checksum(algorithm) {
        info!("Final checksum ({}): {}", algorithm, snapshot.checksum);
    } else {
        warn!("Final checksum ({}) does not match world content: {}", algorithm, snapshot.checksum);
    }
}
