use serde::{Deserialize, Serialize};

/// One totally ordered, broadcastable action
///
/// `sequence` and `timestamp` are zero until the broadcaster accepts the
/// operation and stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub sequence: u64,
    pub client_id: String,
    pub op_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

impl Operation {
    pub fn new(
        client_id: impl Into<String>,
        op_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            sequence: 0,
            client_id: client_id.into(),
            op_type: op_type.into(),
            payload,
            timestamp: 0,
        }
    }

    pub fn is_sequenced(&self) -> bool {
        self.sequence > 0
    }
}
