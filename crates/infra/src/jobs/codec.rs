//! Job envelope encoding.
//!
//! Arguments travel as JSON values inside [`Job::payload`](super::Job).

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::JobError;

pub fn encode<T: Serialize>(queue: &str, arguments: &T) -> Result<serde_json::Value, JobError> {
    serde_json::to_value(arguments).map_err(|e| JobError::Enqueue {
        queue: queue.to_string(),
        message: format!("failed to encode arguments: {e}"),
    })
}

/// Decode typed arguments; any mismatch is a terminal `MalformedPayload`.
pub fn decode<T: DeserializeOwned>(queue: &str, payload: &serde_json::Value) -> Result<T, JobError> {
    T::deserialize(payload).map_err(|e| JobError::MalformedPayload {
        queue: queue.to_string(),
        message: e.to_string(),
    })
}
