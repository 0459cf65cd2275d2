// Wire protocol: decoding inbound client payloads and the messages sent back
// over the WebSocket.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::inference::InferenceResponse;
use crate::snapshot::{Delta, ReconcileWarning, Snapshot, Update};

/// Keys whose presence marks a payload as a delta.
const DELTA_KEYS: [&str; 3] = ["added", "removed", "updated"];

/// Error decoding an inbound payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("unknown update_type '{0}', expected 'full' or 'delta'")]
    UnknownUpdateType(String),
}

/// Decode a raw text frame.
pub fn decode_update(raw: &str) -> Result<Update, PayloadError> {
    let value: Value = serde_json::from_str(raw)?;
    update_from_value(value)
}

/// Decode an already-parsed payload. An explicit `update_type` wins; otherwise
/// any of `added`/`removed`/`updated` marks a delta.
pub fn update_from_value(mut value: Value) -> Result<Update, PayloadError> {
    let obj = value.as_object_mut().ok_or(PayloadError::NotAnObject)?;

    let is_delta = match obj.remove("update_type") {
        Some(Value::String(t)) if t == "full" => false,
        Some(Value::String(t)) if t == "delta" || t == "partial" => true,
        Some(other) => {
            let label = match other {
                Value::String(s) => s,
                v => v.to_string(),
            };
            return Err(PayloadError::UnknownUpdateType(label));
        }
        None => DELTA_KEYS.iter().any(|k| obj.contains_key(*k)),
    };

    if is_delta {
        Ok(Update::Delta(serde_json::from_value::<Delta>(value)?))
    } else {
        Ok(Update::Full(serde_json::from_value::<Snapshot>(value)?))
    }
}

/// Messages sent from the server to a WebSocket client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once on connect.
    Hello { session_id: String },
    /// Reconciliation and inference succeeded.
    Response {
        session_id: String,
        warnings: Vec<ReconcileWarning>,
        response: InferenceResponse,
    },
    /// The request failed; `kind` is a stable machine-readable name.
    Error { kind: String, error: String },
}

impl ServerMessage {
    pub fn error(kind: &str, error: impl ToString) -> Self {
        ServerMessage::Error {
            kind: kind.to_string(),
            error: error.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","kind":"internal","error":"{e}"}}"#)
        })
    }
}
