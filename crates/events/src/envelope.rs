use core::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use catalog_core::ProductId;

/// Field values carried by a command (field name → JSON value).
pub type Payload = Map<String, JsonValue>;

const ACTION_KEY: &str = "action";
const PRODUCT_ID_KEY: &str = "product_id";

/// Mutation kind carried by an envelope; determines consumer-side dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Create, Action::Update, Action::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Wire key used for the informational timestamp of this action.
    pub fn timestamp_key(&self) -> &'static str {
        match self {
            Action::Create => "created_at",
            Action::Update => "updated_at",
            Action::Delete => "deleted_at",
        }
    }
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(DecodeError::UnknownAction(other.to_string())),
        }
    }
}

/// Why a raw record could not be turned into a [`CommandEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown action `{0}`")]
    UnknownAction(String),
}

/// A product command as it travels through the log.
///
/// On the wire this is a flat JSON object: `action` and `product_id` sit next
/// to the payload fields, plus an optional action-specific timestamp
/// (`created_at` / `updated_at` / `deleted_at`).
///
/// Notes:
/// - The payload never contains the reserved keys; they are stripped on construction.
/// - `delete` envelopes carry an empty payload.
/// - `timestamp` is informational and never used for ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    product_id: ProductId,
    action: Action,
    payload: Payload,
    timestamp: Option<DateTime<Utc>>,
}

impl CommandEnvelope {
    pub fn new(product_id: ProductId, action: Action, payload: Payload) -> Self {
        let payload = match action {
            Action::Delete => Payload::new(),
            Action::Create | Action::Update => strip_reserved(payload),
        };

        Self {
            product_id,
            action,
            payload,
            timestamp: None,
        }
    }

    pub fn create(product_id: ProductId, payload: Payload) -> Self {
        Self::new(product_id, Action::Create, payload)
    }

    pub fn update(product_id: ProductId, payload: Payload) -> Self {
        Self::new(product_id, Action::Update, payload)
    }

    pub fn delete(product_id: ProductId) -> Self {
        Self::new(product_id, Action::Delete, Payload::new())
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Flatten into the wire object.
    pub fn to_wire(&self) -> JsonValue {
        let mut object = self.payload.clone();
        object.insert(
            PRODUCT_ID_KEY.to_string(),
            JsonValue::String(self.product_id.to_string()),
        );
        object.insert(
            ACTION_KEY.to_string(),
            JsonValue::String(self.action.as_str().to_string()),
        );
        if let Some(ts) = self.timestamp {
            object.insert(
                self.action.timestamp_key().to_string(),
                JsonValue::String(ts.to_rfc3339()),
            );
        }
        JsonValue::Object(object)
    }

    /// Encode to UTF-8 JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_wire())
    }

    /// Decode UTF-8 JSON bytes produced by [`CommandEnvelope::encode`] (or any
    /// producer following the same flat layout).
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let text = core::str::from_utf8(bytes).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))?;
        let value: JsonValue =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        Self::from_wire(value)
    }

    pub fn from_wire(value: JsonValue) -> Result<Self, DecodeError> {
        let JsonValue::Object(mut object) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let action = match object.remove(ACTION_KEY) {
            None | Some(JsonValue::Null) => return Err(DecodeError::MissingField(ACTION_KEY)),
            Some(JsonValue::String(s)) => s.parse::<Action>()?,
            Some(other) => {
                return Err(DecodeError::InvalidField {
                    field: ACTION_KEY,
                    reason: format!("expected string, found {other}"),
                });
            }
        };

        let product_id = match object.remove(PRODUCT_ID_KEY) {
            None | Some(JsonValue::Null) => return Err(DecodeError::MissingField(PRODUCT_ID_KEY)),
            Some(JsonValue::String(s)) => ProductId::new(s).map_err(|e| DecodeError::InvalidField {
                field: PRODUCT_ID_KEY,
                reason: e.to_string(),
            })?,
            Some(other) => {
                return Err(DecodeError::InvalidField {
                    field: PRODUCT_ID_KEY,
                    reason: format!("expected string, found {other}"),
                });
            }
        };

        // Informational only: an unreadable timestamp is dropped, not rejected.
        let timestamp = object
            .get(action.timestamp_key())
            .and_then(JsonValue::as_str)
            .and_then(parse_timestamp);

        let envelope = Self::new(product_id, action, object);
        Ok(match timestamp {
            Some(ts) => envelope.with_timestamp(ts),
            None => envelope,
        })
    }
}

fn strip_reserved(mut payload: Payload) -> Payload {
    payload.remove(ACTION_KEY);
    payload.remove(PRODUCT_ID_KEY);
    for action in Action::ALL {
        payload.remove(action.timestamp_key());
    }
    payload
}

/// Accepts RFC 3339 and naive ISO-8601 (assumed UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
