//! WebSocket message types for the relay protocol.
//!
//! Clients speak `{"type": <string>, "data": <any>}` JSON objects. The server
//! answers with the same object plus a `clientid` field naming the sender.

use std::num::NonZeroU64;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Server-assigned identity of a connected client. Always strictly positive.
pub type ClientId = NonZeroU64;

/// `clientid` carried by messages that originate from the hardware, not a client.
pub const SYSTEM_CLIENT_ID: u64 = 0;

// ============================================================================
// Messages
// ============================================================================

/// A relay message, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Registration acknowledgement sent to a freshly connected client.
    Register,

    /// Drive direction (`"dir"`), forwarded to the hardware as `M<value>`.
    Direction(CommandValue),

    /// Drive speed (`"speed"`), forwarded to the hardware as `S<value>`.
    Speed(CommandValue),

    /// Decoded telemetry fields in wire order.
    Telemetry(Vec<Value>),

    /// Any other message type; relayed untouched.
    Passthrough { kind: String, data: Option<Value> },
}

impl Message {
    /// The `type` tag used on the wire.
    pub fn kind(&self) -> &str {
        match self {
            Message::Register => "register",
            Message::Direction(_) => "dir",
            Message::Speed(_) => "speed",
            Message::Telemetry(_) => "telemetry",
            Message::Passthrough { kind, .. } => kind,
        }
    }

    /// Decode a message from its `type` tag and optional `data` payload.
    pub fn decode(kind: String, data: Option<Value>) -> Result<Self, ProtocolError> {
        match kind.as_str() {
            "" => Err(ProtocolError::EmptyType),
            "dir" => CommandValue::parse("dir", data).map(Message::Direction),
            "speed" => CommandValue::parse("speed", data).map(Message::Speed),
            _ => Ok(Message::Passthrough { kind, data }),
        }
    }
}

/// A scalar command argument: the client's original JSON plus its ASCII rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandValue {
    raw: Value,
    text: String,
}

impl CommandValue {
    /// Validate a `dir`/`speed` payload.
    ///
    /// Strings, numbers and booleans are accepted. The rendered text must be non-empty
    /// printable ASCII so it can be written to the device verbatim.
    pub fn parse(kind: &'static str, data: Option<Value>) -> Result<Self, ProtocolError> {
        let raw = data.ok_or(ProtocolError::NonScalarValue {
            kind,
            found: "nothing",
        })?;

        let text = match &raw {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(ProtocolError::NonScalarValue {
                    kind,
                    found: json_type_name(other),
                });
            }
        };

        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
            return Err(ProtocolError::InvalidCommandValue { kind, value: text });
        }

        Ok(Self { raw, text })
    }

    /// Text written to the device after the opcode.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The value exactly as the client sent it.
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Frames (Client -> Server)
// ============================================================================

/// A decoded client frame.
///
/// Top-level fields other than `type` and `data` are kept in `extra` so the
/// echo differs from the inbound frame only by `clientid`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub message: Message,
    pub extra: Map<String, Value>,
}

impl ClientFrame {
    /// Parse and validate a text frame from a client.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut fields: Map<String, Value> = serde_json::from_str(text)?;

        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            Some(_) | None => return Err(ProtocolError::EmptyType),
        };
        let data = fields.remove("data");
        // Identity is always assigned by the server.
        fields.remove("clientid");

        Ok(Self {
            message: Message::decode(kind, data)?,
            extra: fields,
        })
    }
}

// ============================================================================
// Envelopes (Server -> Client)
// ============================================================================

/// A message stamped with the `clientid` of its origin, ready for fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub extra: Map<String, Value>,
    pub clientid: u64,
}

impl Envelope {
    /// Stamp a client frame with its sender's id.
    pub fn from_client(sender: ClientId, frame: ClientFrame) -> Self {
        Self {
            message: frame.message,
            extra: frame.extra,
            clientid: sender.get(),
        }
    }

    /// Wrap a hardware-originated message.
    pub fn system(message: Message) -> Self {
        Self {
            message,
            extra: Map::new(),
            clientid: SYSTEM_CLIENT_ID,
        }
    }

    /// The registration acknowledgement for a new client.
    pub fn register(client_id: ClientId) -> Self {
        Self {
            message: Message::Register,
            extra: Map::new(),
            clientid: client_id.get(),
        }
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.message.kind())?;
        match &self.message {
            Message::Register => {}
            Message::Direction(value) | Message::Speed(value) => {
                map.serialize_entry("data", value.raw())?;
            }
            Message::Telemetry(fields) => map.serialize_entry("data", fields)?,
            Message::Passthrough { data, .. } => {
                if let Some(data) = data {
                    map.serialize_entry("data", data)?;
                }
            }
        }
        for (key, value) in &self.extra {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("clientid", &self.clientid)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(n: u64) -> ClientId {
        ClientId::new(n).unwrap()
    }

    #[test]
    fn test_parse_direction() {
        let frame = ClientFrame::parse(r#"{"type":"dir","data":"FWD"}"#).unwrap();
        match frame.message {
            Message::Direction(value) => assert_eq!(value.as_str(), "FWD"),
            other => panic!("unexpected message {other:?}"),
        }
        assert!(frame.extra.is_empty());
    }

    #[test]
    fn test_parse_numeric_speed_keeps_number() {
        let frame = ClientFrame::parse(r#"{"type":"speed","data":75}"#).unwrap();
        let Message::Speed(value) = &frame.message else {
            panic!("expected speed");
        };
        assert_eq!(value.as_str(), "75");
        assert_eq!(value.raw(), &json!(75));
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(matches!(
            ClientFrame::parse("[1,2,3]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientFrame::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_bool_command_value() {
        let frame = ClientFrame::parse(r#"{"type":"dir","data":true}"#).unwrap();
        let Message::Direction(value) = &frame.message else {
            panic!("expected dir");
        };
        assert_eq!(value.as_str(), "true");
    }

    #[test]
    fn test_parse_rejects_missing_or_empty_type() {
        assert!(matches!(
            ClientFrame::parse(r#"{"data":1}"#),
            Err(ProtocolError::EmptyType)
        ));
        assert!(matches!(
            ClientFrame::parse(r#"{"type":"","data":1}"#),
            Err(ProtocolError::EmptyType)
        ));
        assert!(matches!(
            ClientFrame::parse(r#"{"type":7}"#),
            Err(ProtocolError::EmptyType)
        ));
    }

    #[test]
    fn test_parse_rejects_bad_command_values() {
        assert!(matches!(
            ClientFrame::parse(r#"{"type":"dir","data":{"x":1}}"#),
            Err(ProtocolError::NonScalarValue { kind: "dir", found: "object" })
        ));
        assert!(matches!(
            ClientFrame::parse(r#"{"type":"speed"}"#),
            Err(ProtocolError::NonScalarValue { found: "nothing", .. })
        ));
        assert!(matches!(
            ClientFrame::parse(r#"{"type":"dir","data":"F\nW"}"#),
            Err(ProtocolError::InvalidCommandValue { .. })
        ));
        assert!(matches!(
            ClientFrame::parse(r#"{"type":"dir","data":""}"#),
            Err(ProtocolError::InvalidCommandValue { .. })
        ));
    }

    #[test]
    fn test_unknown_type_is_passthrough() {
        let frame = ClientFrame::parse(r#"{"type":"chat","data":{"text":"hi"}}"#).unwrap();
        assert_eq!(
            frame.message,
            Message::Passthrough {
                kind: "chat".to_string(),
                data: Some(json!({"text": "hi"})),
            }
        );
    }

    #[test]
    fn test_client_cannot_spoof_clientid() {
        let frame = ClientFrame::parse(r#"{"type":"chat","data":1,"clientid":99}"#).unwrap();
        let json: Value =
            serde_json::from_str(&Envelope::from_client(id(3), frame).to_json().unwrap()).unwrap();
        assert_eq!(json["clientid"], 3);
    }

    #[test]
    fn test_echo_only_adds_clientid() {
        let inputs = [
            json!({"type": "dir", "data": "FWD"}),
            json!({"type": "speed", "data": 12.5}),
            json!({"type": "chat", "data": null}),
            json!({"type": "chat", "data": [1, "two", {"three": 3}], "room": "lobby"}),
            json!({"type": "ping"}),
        ];

        for input in inputs {
            let frame = ClientFrame::parse(&input.to_string()).unwrap();
            let echoed: Value =
                serde_json::from_str(&Envelope::from_client(id(7), frame).to_json().unwrap())
                    .unwrap();

            let mut expected = input.clone();
            expected
                .as_object_mut()
                .unwrap()
                .insert("clientid".to_string(), json!(7));
            assert_eq!(echoed, expected, "echo of {input}");
        }
    }

    #[test]
    fn test_register_envelope() {
        let json = Envelope::register(id(1)).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, json!({"type": "register", "clientid": 1}));
    }

    #[test]
    fn test_system_telemetry_envelope() {
        let envelope = Envelope::system(Message::Telemetry(vec![json!(10), json!(20)]));
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "telemetry", "data": [10, 20], "clientid": SYSTEM_CLIENT_ID})
        );
    }
}
