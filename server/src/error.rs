use sync_shared::{PayloadError, Rejection};

/// Errors produced by the causal engine, the avatar registry and the
/// sequence broadcaster
///
/// Every variant is local to the single attempt that produced it; none of
/// them leaves the world state partially modified.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// The deferred-delta queue is full; the caller may resubmit later.
    #[error("causality violation: delta {delta_id} is not causally ready and the deferred queue is full ({queued} waiting)")]
    CausalityViolation { delta_id: String, queued: usize },

    /// The delta's checksum does not match its content.
    #[error("integrity failure: checksum mismatch on delta {delta_id}")]
    IntegrityFailure { delta_id: String },

    #[error("malformed payload in delta {delta_id}: {reason}")]
    MalformedPayload { delta_id: String, reason: String },

    #[error("entity '{entity_id}' does not exist")]
    UnknownEntity { entity_id: String },

    #[error("entity '{entity_id}' already exists")]
    EntityExists { entity_id: String },

    #[error("delta {delta_id} has already been applied")]
    DuplicateDelta { delta_id: String },

    #[error("no avatar registered for '{key}'")]
    AvatarNotFound { key: String },

    #[error("client '{client_id}' is not registered")]
    ClientNotFound { client_id: String },

    #[error("invalid sequence range {from}..={to}")]
    InvalidRange { from: u64, to: u64 },
}

impl SyncError {
    pub fn malformed(delta_id: &str, err: PayloadError) -> Self {
        SyncError::MalformedPayload {
            delta_id: delta_id.to_string(),
            reason: err.to_string(),
        }
    }

    /// True when resubmitting the same request may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::CausalityViolation { .. })
    }

    /// Client-facing form of a refused delta
    pub fn to_rejection(&self, delta_id: &str) -> Rejection {
        Rejection {
            delta_id: delta_id.to_string(),
            reason: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}
