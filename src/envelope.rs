//! Message envelope validated at the relay boundary.
//!
//! Wire format: a JSON object holding the application payload plus two
//! optional reserved fields:
//!
//! - `uuid`: string identifier
//! - `run_at`: epoch seconds; a future value makes the message *delayed*
//!
//! Anything that is not such an object is rejected at ingestion.

use serde_json::{Map, Value};

use crate::error::EnvelopeError;

/// Reserved field carrying the message identifier.
pub const ID_FIELD: &str = "uuid";

/// Reserved field carrying the delivery time.
pub const RUN_AT_FIELD: &str = "run_at";

/// Where an inbound message goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Insert into the ready set now.
    Ready(String),
    /// Hold in the delayed set until `due`.
    Delayed { message: String, due: f64 },
}

/// A parsed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    raw: String,
    fields: Map<String, Value>,
    id: Option<String>,
    run_at: Option<f64>,
}

impl Envelope {
    /// Parses and validates a wire payload.
    ///
    /// A `null` `run_at` is treated as absent.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let fields = match serde_json::from_str::<Value>(raw)? {
            Value::Object(fields) => fields,
            _ => return Err(EnvelopeError::NotAnObject),
        };

        let id = match fields.get(ID_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(other) => {
                return Err(EnvelopeError::InvalidField {
                    field: ID_FIELD,
                    reason: format!("expected a string, got {}", other),
                })
            }
        };

        let run_at = match fields.get(RUN_AT_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => match n.as_f64() {
                Some(t) if t.is_finite() => Some(t),
                _ => {
                    return Err(EnvelopeError::InvalidField {
                        field: RUN_AT_FIELD,
                        reason: format!("{} is not a usable timestamp", n),
                    })
                }
            },
            Some(other) => {
                return Err(EnvelopeError::InvalidField {
                    field: RUN_AT_FIELD,
                    reason: format!("expected epoch seconds, got {}", other),
                })
            }
        };

        if !fields
            .keys()
            .any(|k| k != ID_FIELD && k != RUN_AT_FIELD)
        {
            return Err(EnvelopeError::EmptyPayload);
        }

        Ok(Self {
            raw: raw.to_string(),
            fields,
            id,
            run_at,
        })
    }

    /// Builds an envelope around an application payload.
    pub fn from_payload(payload: Map<String, Value>) -> Self {
        let raw = Value::Object(payload.clone()).to_string();
        Self {
            raw,
            fields: payload,
            id: None,
            run_at: None,
        }
    }

    /// Sets the identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.fields
            .insert(ID_FIELD.to_string(), Value::String(id.clone()));
        self.id = Some(id);
        self.raw = Value::Object(self.fields.clone()).to_string();
        self
    }

    /// Sets the delivery time in epoch seconds.
    pub fn with_run_at(mut self, run_at: f64) -> Self {
        if let Some(n) = serde_json::Number::from_f64(run_at) {
            self.fields.insert(RUN_AT_FIELD.to_string(), Value::Number(n));
            self.run_at = Some(run_at);
            self.raw = Value::Object(self.fields.clone()).to_string();
        }
        self
    }

    /// The message identifier, if any.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The requested delivery time, if any.
    pub fn run_at(&self) -> Option<f64> {
        self.run_at
    }

    /// The wire text as received.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Application fields, without the reserved ones.
    pub fn payload(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields
            .iter()
            .filter(|(k, _)| *k != ID_FIELD && *k != RUN_AT_FIELD)
    }

    /// Whether delivery must wait past `now`.
    pub fn is_delayed(&self, now: f64) -> bool {
        matches!(self.run_at, Some(t) if t > now)
    }

    /// Serializes the message without its `run_at` field, keeping field order.
    pub fn without_run_at(&self) -> String {
        let fields: Map<String, Value> = self
            .fields
            .iter()
            .filter(|(k, _)| *k != RUN_AT_FIELD)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(fields).to_string()
    }

    /// Decides routing at time `now`.
    ///
    /// Messages without `run_at` travel byte-for-byte. Messages with one are
    /// stored without it, so nothing downstream ever sees the field.
    pub fn route(&self, now: f64) -> Route {
        match self.run_at {
            None => Route::Ready(self.raw.clone()),
            Some(due) if due > now => Route::Delayed {
                message: self.without_run_at(),
                due,
            },
            Some(_) => Route::Ready(self.without_run_at()),
        }
    }
}
