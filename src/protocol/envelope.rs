use crate::{CorrelationId, Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Correlation role of an outbound envelope.
///
/// The codec only accepts one of these, so a single encode can never carry
/// both a request id and a reply id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Correlation {
    /// Plain one-way message.
    #[default]
    None,

    /// A request: the responder must echo this id back.
    Request(CorrelationId),

    /// A reply to the request that carried this id.
    Reply(CorrelationId),
}

impl Correlation {
    pub(crate) fn request_id(&self) -> Option<&CorrelationId> {
        match self {
            Correlation::Request(id) => Some(id),
            _ => None,
        }
    }

    pub(crate) fn reply_id(&self) -> Option<&CorrelationId> {
        match self {
            Correlation::Reply(id) => Some(id),
            _ => None,
        }
    }
}

impl From<Option<CorrelationId>> for Correlation {
    /// An optional id supplied to `send` marks the message as a reply.
    fn from(value: Option<CorrelationId>) -> Self {
        match value {
            Some(id) => Correlation::Reply(id),
            None => Correlation::None,
        }
    }
}

/// A decoded message.
///
/// All fields are optional on the wire; decoding only requires a JSON
/// object. Missing fields take their defaults (`0`, `null`, `""`), and the
/// informational `ts` and `from_topic` never fail a decode: a value of the
/// wrong type is read as its default (a fractional `ts` is truncated).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    // ---
    /// Creation time in epoch milliseconds. Informational only.
    #[serde(rename = "ts", default, deserialize_with = "lenient_millis")]
    pub sent_at: u64,

    /// Application data.
    #[serde(rename = "data", default)]
    pub payload: Value,

    /// Identifier topic of the sender; replies go here.
    #[serde(rename = "from_topic", default, deserialize_with = "lenient_string")]
    pub sender: String,

    /// Set on requests: the id the responder must echo back.
    #[serde(rename = "request_id", default)]
    pub reply_to_id: Option<CorrelationId>,

    /// Set on replies: the id of the request being answered.
    #[serde(rename = "callback_id", default)]
    pub correlates_id: Option<CorrelationId>,
}

impl Envelope {
    // ---
    /// Returns the id to echo back if this envelope is a request.
    pub fn request_id(&self) -> Option<&CorrelationId> {
        self.reply_to_id.as_ref().filter(|id| !id.is_empty())
    }

    /// Returns the id of the request this envelope answers, if any.
    pub fn reply_id(&self) -> Option<&CorrelationId> {
        self.correlates_id.as_ref().filter(|id| !id.is_empty())
    }

    pub fn is_request(&self) -> bool {
        self.request_id().is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.reply_id().is_some()
    }

    /// Deserialize the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.payload).map_err(Error::Decode)
    }
}

fn lenient_millis<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    // ---
    let millis = match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or_default(),
        _ => 0,
    };
    Ok(millis)
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        _ => Ok(String::new()),
    }
}
