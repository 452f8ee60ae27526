//! Envelope codec (JSON).

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;

use super::{Correlation, Envelope};
use crate::{CorrelationId, Error, Result};

/// Borrowed outbound form of [`Envelope`], so the payload is serialized
/// straight into the output buffer.
#[derive(Serialize)]
struct Outbound<'a, T: ?Sized> {
    ts: u64,
    data: &'a T,
    from_topic: &'a str,
    request_id: Option<&'a CorrelationId>,
    callback_id: Option<&'a CorrelationId>,
}

/// Encode a message from `sender`, stamping the current time.
///
/// # Errors
///
/// Returns [`Error::Encode`] if `payload` cannot be serialized.
pub fn encode<T>(sender: &str, payload: &T, correlation: &Correlation) -> Result<Bytes>
where
    T: Serialize + ?Sized,
{
    // ---
    let outbound = Outbound {
        ts: now_millis(),
        data: payload,
        from_topic: sender,
        request_id: correlation.request_id(),
        callback_id: correlation.reply_id(),
    };

    let bytes = serde_json::to_vec(&outbound).map_err(Error::Encode)?;
    Ok(Bytes::from(bytes))
}

/// Decode raw transport bytes into an [`Envelope`].
///
/// # Errors
///
/// Returns [`Error::Decode`] if the bytes are not a JSON object.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(bytes).map_err(Error::Decode)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_wire_field_names() {
        // ---
        let id = CorrelationId::from("id-1");
        let bytes = encode("svc-a", &json!({"op": "ping"}), &Correlation::Request(id)).unwrap();

        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["data"], json!({"op": "ping"}));
        assert_eq!(raw["from_topic"], "svc-a");
        assert_eq!(raw["request_id"], "id-1");
        assert_eq!(raw["callback_id"], Value::Null);
        assert!(raw["ts"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_reply_sets_only_callback_id() {
        // ---
        let id = CorrelationId::from("id-2");
        let bytes = encode("svc-b", &json!({"pong": true}), &Correlation::Reply(id.clone())).unwrap();

        let env = decode(&bytes).unwrap();
        assert_eq!(env.correlates_id, Some(id));
        assert_eq!(env.reply_to_id, None);
        assert_eq!(env.sender, "svc-b");
        assert_eq!(env.payload, json!({"pong": true}));
    }

    #[test]
    fn test_one_way_sets_neither_id() {
        // ---
        let bytes = encode("svc-a", "hello", &Correlation::None).unwrap();
        let env = decode(&bytes).unwrap();
        assert!(env.reply_to_id.is_none());
        assert!(env.correlates_id.is_none());
        assert_eq!(env.payload, json!("hello"));
    }

    #[test]
    fn test_decode_foreign_sender() {
        // ---
        let raw = br#"{"ts":1700000000000,"data":[1,2,3],"from_topic":"js-client","request_id":"abc","callback_id":null}"#;
        let env = decode(raw).unwrap();
        assert_eq!(env.sent_at, 1_700_000_000_000);
        assert_eq!(env.request_id().map(CorrelationId::as_str), Some("abc"));
        assert!(!env.is_reply());
    }

    #[test]
    fn test_decode_missing_fields_defaults() {
        // ---
        let env = decode(br#"{"data": 5}"#).unwrap();
        assert_eq!(env.payload, json!(5));
        assert_eq!(env.sender, "");
        assert!(env.correlates_id.is_none());
    }

    #[test]
    fn test_decode_tolerates_odd_informational_fields() {
        // ---
        let env = decode(br#"{"ts":null,"data":1,"from_topic":"svc-b","callback_id":"id-3"}"#).unwrap();
        assert_eq!(env.sent_at, 0);
        assert_eq!(env.reply_id().map(CorrelationId::as_str), Some("id-3"));

        let env = decode(br#"{"ts":1700000000000.5,"data":1}"#).unwrap();
        assert_eq!(env.sent_at, 1_700_000_000_000);

        let env = decode(br#"{"ts":-5,"data":1,"from_topic":null}"#).unwrap();
        assert_eq!(env.sent_at, 0);
        assert_eq!(env.sender, "");

        let env = decode(br#"{"ts":"yesterday","data":1,"from_topic":42}"#).unwrap();
        assert_eq!(env.sent_at, 0);
        assert_eq!(env.sender, "");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // ---
        assert!(matches!(decode(b"not json"), Err(Error::Decode(_))));
        assert!(matches!(decode(b"{\"ts\": "), Err(Error::Decode(_))));
        assert!(matches!(decode(b"\"text\""), Err(Error::Decode(_))));
        assert!(matches!(decode(&[0xff, 0xfe]), Err(Error::Decode(_))));
    }
}
