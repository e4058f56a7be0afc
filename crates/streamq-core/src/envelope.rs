use crate::{QueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Headers carried alongside every envelope.
///
/// Known fields are typed; `extra` keeps the block open so producers and
/// consumers on different versions can still exchange envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    /// Number of completed delivery cycles before this one. A freshly
    /// enqueued message carries 0; each retry re-enqueues with `attempt + 1`.
    pub attempt: u32,

    /// When the message was first appended to the broker.
    pub enqueued_at: DateTime<Utc>,

    /// Correlation id shared by all retries of one logical invocation.
    pub correlation_id: String,

    /// Free-form headers for forward compatibility.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Headers {
    /// Headers for a first delivery, with a fresh correlation id.
    pub fn new() -> Self {
        Headers {
            attempt: 0,
            enqueued_at: Utc::now(),
            correlation_id: Uuid::new_v4().to_string(),
            extra: BTreeMap::new(),
        }
    }
}

impl Default for Headers {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire-level record carrying one encoded task invocation.
///
/// The body is opaque to everything except the serialization backend named
/// by `backend_tag`; the envelope frame itself has a fixed schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Registry tag of the backend that encoded (and must decode) the body.
    pub backend_tag: String,

    /// Task name resolved by the router at dispatch time.
    pub task_name: String,

    /// Encoded task arguments.
    pub body: Vec<u8>,

    pub headers: Headers,
}

impl Envelope {
    pub fn new(backend_tag: String, task_name: String, body: Vec<u8>) -> Self {
        Envelope {
            backend_tag,
            task_name,
            body,
            headers: Headers::new(),
        }
    }

    /// Serialize the envelope frame for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| QueueError::MalformedEnvelope(e.to_string()))
    }

    /// Deserialize an envelope frame from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| QueueError::MalformedEnvelope(e.to_string()))
    }

    /// A fresh copy for re-enqueueing after a transient failure, with the
    /// attempt counter advanced. Correlation id and enqueue time carry over.
    pub fn retried(&self) -> Envelope {
        let mut next = self.clone();
        next.headers.attempt += 1;
        next
    }
}
