//! Total-order reliable broadcast of operations
//!
//! This module is the second consistency layer next to the causal engine:
//! - Every submitted operation gets the next global sequence number
//! - Operations are kept in a bounded log for gap recovery and full replay
//! - Each registered client has a bounded outbound queue and a cursor
//!
//! Fan-out never blocks the submitter. When one client's queue is full that
//! single delivery is dropped and the client is expected to catch up through
//! [`SequenceBroadcaster::get_missing_operations`].

use crate::config::SyncConfig;
use crate::error::SyncError;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use sync_shared::{now_millis, Operation};
use tokio::sync::{mpsc, RwLock};

/// Outbound queue and acknowledgment cursor for one client
#[derive(Debug)]
struct ClientCursor {
    sender: mpsc::Sender<Operation>,
    /// Highest sequence the client has acknowledged
    last_seen: u64,
    /// Deliveries dropped because the queue was full
    dropped: u64,
}

struct BroadcastState {
    sequence: u64,
    log: BTreeMap<u64, Operation>,
    clients: HashMap<String, ClientCursor>,
    submissions_since_cleanup: u64,
    total_submitted: u64,
    total_dropped: u64,
    total_pruned: u64,
}

/// Observability snapshot of the broadcaster
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    /// Highest sequence number assigned so far
    pub current_sequence: u64,
    /// Operations currently held in the log
    pub retained: usize,
    /// Lowest retained sequence, 0 when the log is empty
    pub oldest_retained: u64,
    /// Registered clients
    pub clients: usize,
    /// Operations submitted since startup
    pub total_submitted: u64,
    /// Deliveries dropped because a client queue was full
    pub total_dropped: u64,
    /// Operations removed by log cleanup
    pub total_pruned: u64,
}

/// Assigns a strict global order to operations and fans them out
///
/// Cloning is cheap and every clone shares the same log and cursors.
#[derive(Clone)]
pub struct SequenceBroadcaster {
    state: Arc<RwLock<BroadcastState>>,
    retention_buffer: u64,
    cleanup_interval: u64,
    max_log: usize,
    queue_size: usize,
}

impl SequenceBroadcaster {
    /// Creates an empty broadcaster; the first operation gets sequence 1
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(BroadcastState {
                sequence: 0,
                log: BTreeMap::new(),
                clients: HashMap::new(),
                submissions_since_cleanup: 0,
                total_submitted: 0,
                total_dropped: 0,
                total_pruned: 0,
            })),
            retention_buffer: config.retention_buffer,
            cleanup_interval: config.cleanup_interval.max(1),
            max_log: config.max_operation_log.max(1),
            queue_size: config.client_queue_size.max(1),
        }
    }

    /// Registers a client and hands back the receiving end of its queue
    ///
    /// The cursor starts at the current sequence: a new client is expected
    /// to bootstrap with [`get_all_operations`](Self::get_all_operations)
    /// and then follow the live stream. Registering an id twice replaces the
    /// old queue, which closes the previous receiver.
    pub async fn register_client(&self, client_id: &str) -> mpsc::Receiver<Operation> {
        let (sender, receiver) = mpsc::channel(self.queue_size);
        let mut state = self.state.write().await;
        let last_seen = state.sequence;
        state.clients.insert(
            client_id.to_string(),
            ClientCursor {
                sender,
                last_seen,
                dropped: 0,
            },
        );
        info!("Client {} subscribed to operations at sequence {}", client_id, last_seen);
        receiver
    }

    /// Removes a client's queue and cursor
    ///
    /// Returns false if the client was not registered. Its cursor no longer
    /// holds back log cleanup.
    pub async fn unregister_client(&self, client_id: &str) -> bool {
        let removed = self.state.write().await.clients.remove(client_id);
        match removed {
            Some(cursor) => {
                info!(
                    "Client {} unsubscribed at sequence {} ({} dropped deliveries)",
                    client_id, cursor.last_seen, cursor.dropped
                );
                true
            }
            None => false,
        }
    }

    /// Sequences, stores and fans out one operation
    ///
    /// The sequence number and timestamp are assigned under the write lock,
    /// so concurrent submitters always observe strictly consecutive numbers.
    /// Returns the stamped operation.
    pub async fn submit_operation(&self, mut operation: Operation) -> Operation {
        let mut state = self.state.write().await;
        state.sequence += 1;
        operation.sequence = state.sequence;
        operation.timestamp = now_millis();
        state.log.insert(operation.sequence, operation.clone());
        state.total_submitted += 1;

        let mut dropped = 0;
        for (client_id, cursor) in state.clients.iter_mut() {
            match cursor.sender.try_send(operation.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    cursor.dropped += 1;
                    dropped += 1;
                    warn!(
                        "Outbound queue full for client {}, dropped operation {}",
                        client_id, operation.sequence
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    cursor.dropped += 1;
                    dropped += 1;
                    debug!(
                        "Outbound queue closed for client {}, dropped operation {}",
                        client_id, operation.sequence
                    );
                }
            }
        }
        state.total_dropped += dropped;

        state.submissions_since_cleanup += 1;
        if state.submissions_since_cleanup >= self.cleanup_interval {
            state.submissions_since_cleanup = 0;
            self.cleanup(&mut state);
        }

        operation
    }

    /// Prunes operations every registered client is safely past
    ///
    /// The floor is the slowest client's cursor minus the retention buffer.
    /// With no client registered the newest `max_operation_log` operations
    /// are kept instead.
    fn cleanup(&self, state: &mut BroadcastState) {
        let floor = match state.clients.values().map(|c| c.last_seen).min() {
            Some(min_seen) => min_seen.saturating_sub(self.retention_buffer),
            None => state.sequence.saturating_sub(self.max_log as u64) + 1,
        };

        let before = state.log.len();
        state.log = state.log.split_off(&floor);
        let removed = before - state.log.len();
        if removed > 0 {
            state.total_pruned += removed as u64;
            debug!(
                "Pruned {} operations below sequence {} ({} retained)",
                removed,
                floor,
                state.log.len()
            );
        }
    }

    /// Current high-water mark, 0 before the first submission
    pub async fn get_current_sequence(&self) -> u64 {
        self.state.read().await.sequence
    }

    /// Retained operations in the inclusive range `from..=to`, ascending
    ///
    /// Used by reconnecting clients to fill gaps in what they received.
    pub async fn get_missing_operations(&self, from: u64, to: u64) -> Result<Vec<Operation>, SyncError> {
        self.get_operations_in_range(from, to).await
    }

    /// Same as [`get_missing_operations`](Self::get_missing_operations);
    /// fails with [`SyncError::InvalidRange`] when `from > to`
    pub async fn get_operations_in_range(&self, from: u64, to: u64) -> Result<Vec<Operation>, SyncError> {
        if from > to {
            return Err(SyncError::InvalidRange { from, to });
        }
        let state = self.state.read().await;
        Ok(state.log.range(from..=to).map(|(_, op)| op.clone()).collect())
    }

    /// Every retained operation, ascending
    pub async fn get_all_operations(&self) -> Vec<Operation> {
        self.state.read().await.log.values().cloned().collect()
    }

    /// Advances a client's acknowledgment cursor
    ///
    /// Cursors never move backwards; stale acknowledgments are ignored.
    pub async fn update_client_last_seen(&self, client_id: &str, sequence: u64) -> Result<u64, SyncError> {
        let mut state = self.state.write().await;
        let cursor = state
            .clients
            .get_mut(client_id)
            .ok_or_else(|| SyncError::ClientNotFound {
                client_id: client_id.to_string(),
            })?;
        cursor.last_seen = cursor.last_seen.max(sequence);
        Ok(cursor.last_seen)
    }

    /// Last acknowledged sequence of a client, if it is registered
    pub async fn get_client_last_seen(&self, client_id: &str) -> Option<u64> {
        self.state.read().await.clients.get(client_id).map(|c| c.last_seen)
    }

    /// Counts only; never clones the log
    pub async fn get_stats(&self) -> BroadcastStats {
        let state = self.state.read().await;
        BroadcastStats {
            current_sequence: state.sequence,
            retained: state.log.len(),
            oldest_retained: state.log.keys().next().copied().unwrap_or(0),
            clients: state.clients.len(),
            total_submitted: state.total_submitted,
            total_dropped: state.total_dropped,
            total_pruned: state.total_pruned,
        }
    }
}
