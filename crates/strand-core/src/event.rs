//! Wire events.
//!
//! Message format: [envelope frames...][empty delimiter][payload]
//! Payload: msgpack array `[header, name, args]`
//! Header: map `{v, message_id, response_to?}`
//!
//! `args` is usually an array, but a `STREAM` item travels as the bare
//! item, so events keep whatever value the peer put there.

use crate::error::StrandError;
use bytes::Bytes;
use rmpv::Value;

/// Protocol version written into every header
pub const PROTOCOL_VERSION: u32 = 3;

/// Control event carrying a new receive capacity: `[capacity]`
pub const MORE: &str = "_zpc_more";

/// Control event carrying a liveness ping: `[0]`
pub const HEARTBEAT: &str = "_zpc_hb";

/// Single result: `[result]`
pub const OK: &str = "OK";

/// Failure: `[kind, message, trace]`
pub const ERR: &str = "ERR";

/// One streamed item, carried as the args value itself
pub const STREAM: &str = "STREAM";

/// End of a stream: `[]`
pub const STREAM_DONE: &str = "STREAM_DONE";

/// Whether an event name is reserved for protocol control
pub fn is_control(name: &str) -> bool {
    name == MORE || name == HEARTBEAT
}

/// Event header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub v: u32,
    pub message_id: String,
    pub response_to: Option<String>,
}

impl Header {
    /// Header of the first event on a channel
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            message_id: message_id.into(),
            response_to: None,
        }
    }

    /// Header of an event answering or continuing `response_to`
    pub fn reply(message_id: impl Into<String>, response_to: impl Into<String>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            message_id: message_id.into(),
            response_to: Some(response_to.into()),
        }
    }

    fn to_value(&self) -> Value {
        let mut entries = vec![
            (Value::from("v"), Value::from(self.v)),
            (Value::from("message_id"), Value::from(self.message_id.as_str())),
        ];
        if let Some(response_to) = &self.response_to {
            entries.push((Value::from("response_to"), Value::from(response_to.as_str())));
        }
        Value::Map(entries)
    }

    fn from_value(value: &Value) -> Result<Self, StrandError> {
        let Value::Map(entries) = value else {
            return Err(StrandError::MalformedEvent("Bad header".to_string()));
        };

        let mut header = Header::new(String::new());
        for (key, value) in entries {
            match key.as_str() {
                Some("v") => {
                    header.v = match value.as_u64() {
                        Some(v) => u32::try_from(v)
                            .map_err(|_| StrandError::MalformedEvent("Bad header".to_string()))?,
                        None => PROTOCOL_VERSION,
                    };
                }
                Some("message_id") => {
                    header.message_id = text(value).unwrap_or_default();
                }
                Some("response_to") => {
                    header.response_to = text(value);
                }
                _ => {}
            }
        }

        if header.message_id.is_empty() {
            return Err(StrandError::MalformedEvent("Bad header".to_string()));
        }
        Ok(header)
    }
}

/// Read a header field that peers may encode as either str or bin
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => s.as_str().map(str::to_string),
        Value::Binary(b) => Some(String::from_utf8_lossy(b).into_owned()),
        _ => None,
    }
}

/// A protocol event
///
/// Events are immutable once created; the owning component moves them
/// between buffers rather than editing them.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Routing address frames of the peer, empty on dealer sockets
    pub envelope: Vec<Bytes>,
    pub header: Header,
    pub name: String,
    /// Arguments exactly as they travel on the wire
    pub args: Value,
}

impl Event {
    /// Create a new event with an argument list
    pub fn new(envelope: Vec<Bytes>, header: Header, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::with_args(envelope, header, name, Value::Array(args))
    }

    /// Create a new event whose args value is sent as-is
    pub fn with_args(envelope: Vec<Bytes>, header: Header, name: impl Into<String>, args: Value) -> Self {
        Self {
            envelope,
            header,
            name: name.into(),
            args,
        }
    }

    /// Args viewed as a list: an array as its items, nil as nothing, and
    /// any other value as a single item
    pub fn args_list(&self) -> &[Value] {
        match &self.args {
            Value::Array(items) => items,
            Value::Nil => &[],
            other => std::slice::from_ref(other),
        }
    }

    /// Owned version of [`Event::args_list`]
    pub fn into_args_list(self) -> Vec<Value> {
        match self.args {
            Value::Array(items) => items,
            Value::Nil => Vec::new(),
            other => vec![other],
        }
    }

    pub fn message_id(&self) -> &str {
        &self.header.message_id
    }

    /// Routing key: the channel this event answers, or "" for a new call
    pub fn response_to(&self) -> &str {
        self.header.response_to.as_deref().unwrap_or("")
    }

    pub fn is_control(&self) -> bool {
        is_control(&self.name)
    }

    /// Encode this event into transport frames
    pub fn serialize(&self) -> Result<Vec<Bytes>, StrandError> {
        let payload = Value::Array(vec![
            self.header.to_value(),
            Value::from(self.name.as_str()),
            self.args.clone(),
        ]);

        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &payload)
            .map_err(|e| StrandError::MalformedEvent(format!("Failed to encode event: {}", e)))?;

        let mut frames = Vec::with_capacity(self.envelope.len() + 2);
        frames.extend(self.envelope.iter().cloned());
        frames.push(Bytes::new());
        frames.push(Bytes::from(buf));
        Ok(frames)
    }

    /// Decode an event from its envelope and payload frame
    pub fn deserialize(envelope: Vec<Bytes>, payload: &[u8]) -> Result<Self, StrandError> {
        let mut reader = payload;
        let decoded = rmpv::decode::read_value(&mut reader)
            .map_err(|e| StrandError::MalformedEvent(format!("Failed to decode payload: {}", e)))?;

        let Value::Array(mut parts) = decoded else {
            return Err(StrandError::MalformedEvent("Expected array of size 3".to_string()));
        };
        if parts.len() != 3 {
            return Err(StrandError::MalformedEvent("Expected array of size 3".to_string()));
        }

        let args = parts.pop().unwrap_or(Value::Nil);
        let name = match parts.pop() {
            Some(Value::String(name)) => name
                .into_str()
                .ok_or_else(|| StrandError::MalformedEvent("Bad name".to_string()))?,
            _ => return Err(StrandError::MalformedEvent("Bad name".to_string())),
        };
        let header = match parts.pop() {
            Some(value) => Header::from_value(&value)?,
            None => return Err(StrandError::MalformedEvent("Bad header".to_string())),
        };

        Ok(Self::with_args(envelope, header, name, args))
    }

    /// Decode an event from a complete transport message
    ///
    /// The last frame is the payload, the one before it must be the empty
    /// delimiter, and everything in front of the delimiter is the envelope.
    pub fn from_message(mut frames: Vec<Bytes>) -> Result<Self, StrandError> {
        if frames.len() < 2 {
            return Err(StrandError::MalformedEvent(format!(
                "Expected at least 2 frames, got {}",
                frames.len()
            )));
        }

        let payload = frames.pop().unwrap_or_default();
        let delimiter = frames.pop().unwrap_or_default();
        if !delimiter.is_empty() {
            return Err(StrandError::MalformedEvent(
                "Expected second to last frame to be an empty delimiter".to_string(),
            ));
        }

        Self::deserialize(frames, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    #[test]
    fn test_serialize_layout() {
        let event = Event::new(
            vec![Bytes::from_static(b"peer-1")],
            Header::reply("m2", "m1"),
            OK,
            vec![Value::from(72)],
        );

        let frames = event.serialize().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"peer-1");
        assert!(frames[1].is_empty());

        let decoded = Event::from_message(frames).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.response_to(), "m1");
    }

    #[test]
    fn test_first_event_has_no_response_to() {
        let event = Event::new(Vec::new(), Header::new("chan"), "add42", vec![Value::from(30)]);
        let frames = event.serialize().unwrap();
        assert_eq!(frames.len(), 2);

        let decoded = Event::from_message(frames).unwrap();
        assert_eq!(decoded.header.response_to, None);
        assert_eq!(decoded.response_to(), "");
        assert_eq!(decoded.header.v, PROTOCOL_VERSION);
    }

    #[test]
    fn test_rejects_wrong_arity() {
        let payload = encode(&Value::Array(vec![Value::from(1), Value::from(2)]));
        let err = Event::deserialize(Vec::new(), &payload).unwrap_err();
        assert!(matches!(err, StrandError::MalformedEvent(_)));
    }

    #[test]
    fn test_rejects_missing_message_id() {
        let header = Value::Map(vec![(Value::from("v"), Value::from(3))]);
        let payload = encode(&Value::Array(vec![header, Value::from("x"), Value::Array(vec![])]));
        let err = Event::deserialize(Vec::new(), &payload).unwrap_err();
        assert_eq!(err.message(), "Bad header");
    }

    #[test]
    fn test_rejects_non_string_name() {
        let header = Header::new("m1").to_value();
        let payload = encode(&Value::Array(vec![header, Value::from(7), Value::Array(vec![])]));
        let err = Event::deserialize(Vec::new(), &payload).unwrap_err();
        assert_eq!(err.message(), "Bad name");
    }

    fn decode(frames: &[Bytes]) -> Value {
        let mut reader = &frames[frames.len() - 1][..];
        rmpv::decode::read_value(&mut reader).unwrap()
    }

    #[test]
    fn test_scalar_args_kept_as_sent() {
        let header = Header::new("m1").to_value();
        let payload = encode(&Value::Array(vec![header, Value::from(STREAM), Value::from(5)]));
        let event = Event::deserialize(Vec::new(), &payload).unwrap();
        assert_eq!(event.args, Value::from(5));
        assert_eq!(event.args_list(), vec![Value::from(5)]);

        let wire = decode(&event.serialize().unwrap());
        assert_eq!(wire[2], Value::from(5));
    }

    #[test]
    fn test_array_item_is_not_flattened() {
        let item = Value::Array(vec![Value::from(7)]);
        let event = Event::with_args(Vec::new(), Header::reply("m2", "m1"), STREAM, item.clone());

        let wire = decode(&event.serialize().unwrap());
        assert_eq!(wire[2], item);

        let decoded = Event::from_message(event.serialize().unwrap()).unwrap();
        assert_eq!(decoded.args, item);
        assert_eq!(decoded.into_args_list(), vec![Value::from(7)]);
    }

    #[test]
    fn test_nil_args_are_an_empty_list() {
        let header = Header::new("m1").to_value();
        let payload = encode(&Value::Array(vec![header, Value::from("ping"), Value::Nil]));
        let event = Event::deserialize(Vec::new(), &payload).unwrap();
        assert!(event.args_list().is_empty());
    }

    #[test]
    fn test_header_is_a_string_keyed_map() {
        let event = Event::new(Vec::new(), Header::reply("m2", "m1"), OK, Vec::new());
        let wire = decode(&event.serialize().unwrap());

        let Value::Map(entries) = &wire[0] else {
            panic!("header must be a map, got {:?}", wire[0]);
        };
        let keys: Vec<&str> = entries.iter().filter_map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["v", "message_id", "response_to"]);
        assert_eq!(entries[0].1, Value::from(PROTOCOL_VERSION));
    }

    #[test]
    fn test_rejects_oversized_version() {
        let header = Value::Map(vec![
            (Value::from("v"), Value::from(u64::from(u32::MAX) + 1)),
            (Value::from("message_id"), Value::from("m1")),
        ]);
        let payload = encode(&Value::Array(vec![header, Value::from("ping"), Value::Array(vec![])]));
        let err = Event::deserialize(Vec::new(), &payload).unwrap_err();
        assert_eq!(err.message(), "Bad header");
    }

    #[test]
    fn test_binary_message_id() {
        let header = Value::Map(vec![
            (Value::from("v"), Value::from(3)),
            (Value::from("message_id"), Value::Binary(b"abc".to_vec())),
        ]);
        let payload = encode(&Value::Array(vec![header, Value::from("ping"), Value::Array(vec![])]));
        let event = Event::deserialize(Vec::new(), &payload).unwrap();
        assert_eq!(event.message_id(), "abc");
    }

    #[test]
    fn test_missing_delimiter() {
        let frames = vec![Bytes::from_static(b"not-empty"), Bytes::from_static(b"\x90")];
        let err = Event::from_message(frames).unwrap_err();
        assert!(err.message().contains("delimiter"));
    }

    #[test]
    fn test_control_names() {
        assert!(is_control(MORE));
        assert!(is_control(HEARTBEAT));
        assert!(!is_control(STREAM));
    }
}
