//! # World Synchronization Server Library
//!
//! This library holds the authoritative, in-memory copy of a shared 3D world
//! and keeps every connected client's view of it consistent under
//! concurrent, out-of-order and lossy delivery.
//!
//! ## Core Responsibilities
//!
//! ### Causal State Replication
//! Clients mutate the world through deltas stamped with their vector clock.
//! A delta is applied only once every update it causally depends on has
//! been applied; concurrent deltas apply in arrival order. Each applied delta
//! bumps the world version and recomputes the world checksum, so replicas
//! that applied the same set of deltas can compare a single digest.
//!
//! ### Total-Order Broadcast
//! Independently of the causal layer, operations receive a strictly
//! increasing global sequence number, are kept in a bounded log and are
//! fanned out to every registered client. Clients that missed broadcasts
//! recover them by range.
//!
//! ## Architecture Design
//!
//! ### Two Independent Locks
//! The causal engine and the sequence broadcaster each guard their state
//! with their own `RwLock`. Snapshots and replays take the read side and run
//! concurrently; mutations are serialized. Nothing couples the two layers
//! transactionally.
//!
//! ### Never Blocking the Caller
//! Applying a delta either mutates the world immediately or queues the delta
//! on a bounded deferred queue; a full queue is an error the caller can
//! retry. Fan-out drops a delivery to a full client queue instead of waiting.
//!
//! ### Background Resolution
//! One causality worker per engine retries deferred deltas whenever the
//! world clock advances and drops those that exceed the causality timeout.
//!
//! ## Module Organization
//!
//! - `config`: tunables, as CLI flags with environment fallbacks
//! - `error`: the error taxonomy shared by both layers
//! - `registry`: composite avatar keys and their lookup index
//! - `world`: delta application against the world state tree
//! - `causal`: the causal sync engine and its resolution worker
//! - `broadcast`: the reliable sequence broadcaster
//! - `hub`: maps client packets onto both layers for a transport
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use sync_server::config::SyncConfig;
//! use sync_server::hub::SyncHub;
//! use sync_shared::Packet;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (hub, mut outbound) = SyncHub::new(SyncConfig::default());
//!     let _tasks = hub.start();
//!
//!     let replies = hub
//!         .handle_packet(
//!             "client-1",
//!             Packet::Connect {
//!                 client_id: "client-1".into(),
//!                 session_id: "session-1".into(),
//!             },
//!         )
//!         .await;
//!     // A transport would now deliver `replies`, then keep draining
//!     // `outbound` for broadcasts, digests and expiry notices.
//!     drop((replies, outbound.try_recv()));
//! }
//! ```

pub mod broadcast;
pub mod causal;
pub mod config;
pub mod error;
pub mod hub;
pub mod registry;
pub mod world;

pub use broadcast::{BroadcastStats, SequenceBroadcaster};
pub use causal::{ApplyOutcome, AppliedDelta, CausalSyncEngine, EngineStats, ExpiredDelta, SyncReport};
pub use config::{ConfigError, SyncConfig};
pub use error::SyncError;
pub use hub::{HubMessage, SyncHub};
pub use registry::{AvatarKey, AvatarRegistry};
