//! Wire shapes exchanged between contexts.
//!
//! ```text
//! Envelope          { id, type: request|push|response, sender?, recipient, data }
//! RequestPayload    { id, type, data }
//! PushPayload       { type, data }
//! ResponsePayload   { request, result: { state: fulfilled, value }
//!                                    | { state: rejected, reason, code? } }
//! ```
//!
//! These shapes must stay structurally stable: independently versioned
//! contexts interoperate through them.

use crate::config::ProtocolConfig;
use crate::error::{Rejection, Result, ThreadsError};
use crate::util::new_id;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outer envelope type; selects the dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Request,
    Push,
    Response,
}

/// One message on the wire. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique per envelope, independent of any request id inside `data`.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub recipient: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Build an envelope with a fresh id. A missing recipient means everyone.
    pub fn new(
        kind: EnvelopeKind,
        sender: Option<&str>,
        recipient: Option<&str>,
        data: Value,
    ) -> Self {
        Self {
            id: new_id(),
            kind,
            sender: sender.map(str::to_string),
            recipient: recipient.unwrap_or(ProtocolConfig::WILDCARD).to_string(),
            data,
        }
    }

    /// Whether an endpoint with id `endpoint` should read this envelope.
    pub fn is_for(&self, endpoint: &str) -> bool {
        self.recipient == endpoint || self.recipient == ProtocolConfig::WILDCARD
    }

    pub fn to_wire(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a raw transported value. Anything that isn't an envelope is `None`.
    pub fn from_wire(raw: &Value) -> Option<Self> {
        Envelope::deserialize(raw).ok()
    }
}

/// Inner payload of a `request` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Logical call id used for response correlation.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Inner payload of a `push` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Inner payload of a `response` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Id of the request being answered.
    pub request: String,
    pub result: Settlement,
}

/// How a request settled on the responding side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Settlement {
    Fulfilled {
        #[serde(default)]
        value: Value,
    },
    Rejected {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl Settlement {
    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Settlement::Fulfilled { value },
            Err(err) => {
                let rejection = Rejection::from(&err);
                Settlement::Rejected {
                    reason: rejection.reason,
                    code: rejection.code,
                }
            }
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self {
            Settlement::Fulfilled { value } => Ok(value),
            Settlement::Rejected { reason, code } => Err(ThreadsError::Remote { code, reason }),
        }
    }
}

/// Parameters of an outgoing `request` or `push`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub recipient: Option<String>,
    pub kind: String,
    pub data: Value,
}

impl Outgoing {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            recipient: None,
            kind: kind.into(),
            data,
        }
    }

    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }
}
