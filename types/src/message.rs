//! JSON messages exchanged over a worker connection.
//!
//! Every WebSocket text frame carries exactly one record. Broker → worker
//! records are tagged by `request_type`; the worker → broker record is a
//! plain [`WorkResponse`].

use serde::{Deserialize, Serialize};

use crate::WorkHash;

/// A unit of work sent to workers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique per dispatch attempt; regenerated when a request escalates.
    pub request_id: String,
    pub hash: WorkHash,
    pub difficulty_multiplier: u32,
    /// Speculative request issued to warm the cache.
    #[serde(default)]
    pub precache: bool,
}

/// Informational message telling a worker about its accrued share.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AwardNotice {
    pub hash: WorkHash,
    pub percent_of_pool: f64,
    pub estimated_award: f64,
}

/// Broker → worker message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum ServerMessage {
    WorkGenerate(WorkItem),
    WorkCancel { hash: WorkHash },
    BlockAwarded(AwardNotice),
}

impl ServerMessage {
    /// Wire name of the message, matching the `request_type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::WorkGenerate(_) => "work_generate",
            ServerMessage::WorkCancel { .. } => "work_cancel",
            ServerMessage::BlockAwarded(_) => "block_awarded",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Worker → broker answer to a [`WorkItem`].
///
/// Fields are kept as raw strings: nothing a worker sends is trusted until the
/// broker has validated it against the pending request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResponse {
    pub request_id: String,
    pub hash: String,
    pub result: String,
}

impl WorkResponse {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
