//! Message envelope and inbound frame classification.
//!
//! Wire shape: a JSON object with a string `type` discriminator. The relay
//! attaches a `timestamp` (RFC 3339, UTC) to every outbound delivery.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::connection::Frame;
use crate::error::MessageError;

pub const TYPE_FIELD: &str = "type";
pub const DATA_FIELD: &str = "data";
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Error text sent back to a client whose frame could not be interpreted.
pub const INVALID_FORMAT: &str = "Invalid message format";

/// Format a delivery timestamp, e.g. `2024-05-26T13:04:11.204518Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// An outbound payload: named fields plus a required `type`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    fields: Map<String, Value>,
}

impl Message {
    pub fn new(kind: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(TYPE_FIELD.to_string(), Value::String(kind.into()));
        Self { fields }
    }

    /// Wrap an arbitrary JSON object. The object must carry a string `type`.
    pub fn from_object(value: Value) -> Result<Self, MessageError> {
        let Value::Object(fields) = value else {
            return Err(MessageError::NotAnObject);
        };
        match fields.get(TYPE_FIELD) {
            Some(Value::String(_)) => Ok(Self { fields }),
            _ => Err(MessageError::MissingType),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set a field. Overwriting `type` with a non-string is ignored.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        if key == TYPE_FIELD && !value.is_string() {
            return None;
        }
        self.fields.insert(key, value)
    }

    pub fn kind(&self) -> &str {
        self.fields
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn pong() -> Self {
        Self::new("pong")
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error").with("message", message.into())
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new("info").with("message", message.into())
    }

    /// Snapshot delivered once, right after a telemetry stream joins.
    pub fn cached_data(data: Value) -> Self {
        Self::new("cached_data").with(DATA_FIELD, data)
    }

    pub fn telemetry_update(data: Value) -> Self {
        Self::new("telemetry_update").with(DATA_FIELD, data)
    }

    /// A client-published event, relayed to the rest of its session.
    pub fn relayed(kind: impl Into<String>, data: Value) -> Self {
        Self::new(kind).with(DATA_FIELD, data)
    }

    /// The message's fields with the delivery timestamp attached.
    pub fn stamped(&self, at: DateTime<Utc>) -> Value {
        let mut fields = self.fields.clone();
        fields.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(format_timestamp(at)),
        );
        Value::Object(fields)
    }

    /// Stamp and serialize once, ready to be shared across recipients.
    pub fn to_frame(&self, at: DateTime<Utc>) -> Frame {
        Arc::from(self.stamped(at).to_string())
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

/// A text frame received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `{"type": "ping"}` keepalive.
    Ping,
    /// `{"type": <string>, "data": <any>}` to be relayed to the session.
    Publish { kind: String, data: Value },
    /// A JSON object without a string `type` or without `data`.
    Incomplete,
}

impl ClientMessage {
    /// Classify a text frame. Non-JSON or non-object text is an error.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut fields) = value else {
            return Err(MessageError::NotAnObject);
        };
        let kind = match fields.remove(TYPE_FIELD) {
            Some(Value::String(kind)) => kind,
            _ => return Ok(ClientMessage::Incomplete),
        };
        if kind == "ping" {
            return Ok(ClientMessage::Ping);
        }
        match fields.remove(DATA_FIELD) {
            Some(data) => Ok(ClientMessage::Publish { kind, data }),
            None => Ok(ClientMessage::Incomplete),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn stamped_preserves_fields_and_adds_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 5, 26, 13, 4, 11).unwrap();
        let msg = Message::relayed("flag", json!({"sector": 2, "colour": "yellow"}));
        let stamped = msg.stamped(at);

        assert_eq!(stamped["type"], "flag");
        assert_eq!(stamped["data"], json!({"sector": 2, "colour": "yellow"}));
        assert_eq!(stamped["timestamp"], "2024-05-26T13:04:11.000000Z");
        assert_eq!(stamped.as_object().unwrap().len(), 3);
    }

    #[test]
    fn timestamp_parses_as_rfc3339() {
        let ts = format_timestamp(Utc::now());
        DateTime::parse_from_rfc3339(&ts).unwrap();
    }

    #[test]
    fn stamping_overwrites_a_stale_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let msg = Message::new("lap").with("timestamp", "yesterday");
        assert_eq!(msg.stamped(at)["timestamp"], "2024-01-01T00:00:00.000000Z");
    }

    #[test]
    fn frame_is_the_stamped_json() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let frame = Message::pong().to_frame(at);
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            parsed,
            json!({"type": "pong", "timestamp": "2024-01-01T00:00:00.000000Z"})
        );
    }

    #[test]
    fn wire_shapes() {
        assert_eq!(Message::pong().kind(), "pong");
        let err = Message::error(INVALID_FORMAT);
        assert_eq!(err.kind(), "error");
        assert_eq!(err.get("message").unwrap(), "Invalid message format");
        assert_eq!(Message::cached_data(json!(1)).kind(), "cached_data");
        assert_eq!(Message::telemetry_update(json!(1)).kind(), "telemetry_update");
    }

    #[test]
    fn from_object_requires_string_type() {
        assert!(Message::from_object(json!({"type": "note", "text": "box"})).is_ok());
        assert!(matches!(
            Message::from_object(json!({"text": "box"})),
            Err(MessageError::MissingType)
        ));
        assert!(matches!(
            Message::from_object(json!({"type": 7})),
            Err(MessageError::MissingType)
        ));
        assert!(matches!(
            Message::from_object(json!([1, 2])),
            Err(MessageError::NotAnObject)
        ));
    }

    #[test]
    fn insert_cannot_clobber_type_with_non_string() {
        let mut msg = Message::new("note");
        assert!(msg.insert("type", 5).is_none());
        assert_eq!(msg.kind(), "note");
    }

    #[test]
    fn serializes_as_plain_object() {
        let msg = Message::info("hello");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "info", "message": "hello"})
        );
    }

    #[test]
    fn parse_ping() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn parse_publish_keeps_data_verbatim() {
        let parsed = ClientMessage::parse(r#"{"type":"pit","data":{"lap":12,"tyres":"hard"}}"#)
            .unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Publish {
                kind: "pit".into(),
                data: json!({"lap": 12, "tyres": "hard"}),
            }
        );
    }

    #[test]
    fn parse_null_data_is_still_a_publish() {
        let parsed = ClientMessage::parse(r#"{"type":"clear","data":null}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Publish { data: Value::Null, .. }));
    }

    #[test]
    fn parse_incomplete_objects() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"foo"}"#).unwrap(),
            ClientMessage::Incomplete
        );
        assert_eq!(
            ClientMessage::parse(r#"{"data":1}"#).unwrap(),
            ClientMessage::Incomplete
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":3,"data":1}"#).unwrap(),
            ClientMessage::Incomplete
        );
    }

    #[test]
    fn parse_rejects_non_objects() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(MessageError::Json(_))
        ));
        assert!(matches!(
            ClientMessage::parse("[1,2,3]"),
            Err(MessageError::NotAnObject)
        ));
    }
}
