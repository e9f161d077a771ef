//! Line protocol spoken by the controller.
//!
//! Inbound lines are `:`-separated with a one-character opcode in field 0:
//! `D:<text>` is a debug line, `P:<v1>:<v2>:...` is telemetry. Outbound
//! commands are the opcode immediately followed by the value, e.g. `MFWD`.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Number, Value};

use crate::ws::CommandValue;

/// Opcode for debug/log lines.
pub const OPCODE_DEBUG: char = 'D';

/// Opcode for telemetry lines.
pub const OPCODE_TELEMETRY: char = 'P';

/// A decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum SerialFrame {
    /// Controller log output; logged locally, never relayed.
    Debug(String),
    /// Telemetry values in wire order.
    Telemetry(Vec<Value>),
    /// An opcode this hub does not know. Ignored.
    Unknown { opcode: String },
    /// A blank line.
    Empty,
}

/// Decode one line (terminator already stripped).
pub fn parse_frame(line: &str) -> SerialFrame {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return SerialFrame::Empty;
    }

    let (opcode, rest) = match line.split_once(':') {
        Some((opcode, rest)) => (opcode, Some(rest)),
        None => (line, None),
    };

    let mut chars = opcode.chars();
    let code = match (chars.next(), chars.next()) {
        (Some(c), None) => c,
        _ => {
            return SerialFrame::Unknown {
                opcode: opcode.to_string(),
            };
        }
    };

    match code {
        OPCODE_DEBUG => SerialFrame::Debug(rest.unwrap_or_default().to_string()),
        OPCODE_TELEMETRY => SerialFrame::Telemetry(
            rest.map(|rest| rest.split(':').map(parse_field).collect())
                .unwrap_or_default(),
        ),
        _ => SerialFrame::Unknown {
            opcode: opcode.to_string(),
        },
    }
}

/// Integers and floats become JSON numbers; anything else stays text.
fn parse_field(field: &str) -> Value {
    let field = field.trim();
    if let Ok(int) = field.parse::<i64>() {
        return Value::from(int);
    }
    if let Some(number) = field.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    Value::String(field.to_string())
}

/// A command for the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareCommand {
    /// `M<direction>`
    Move(String),
    /// `S<speed>`
    Speed(String),
}

impl HardwareCommand {
    pub fn direction(value: &CommandValue) -> Self {
        Self::Move(value.as_str().to_string())
    }

    pub fn speed(value: &CommandValue) -> Self {
        Self::Speed(value.as_str().to_string())
    }

    pub fn opcode(&self) -> char {
        match self {
            HardwareCommand::Move(_) => 'M',
            HardwareCommand::Speed(_) => 'S',
        }
    }

    pub fn value(&self) -> &str {
        match self {
            HardwareCommand::Move(value) | HardwareCommand::Speed(value) => value,
        }
    }

    /// Bytes to write to the device, with an optional trailing terminator.
    pub fn encode(&self, terminator: &str) -> Bytes {
        let value = self.value();
        let mut buf = BytesMut::with_capacity(1 + value.len() + terminator.len());
        buf.put_u8(self.opcode() as u8);
        buf.put_slice(value.as_bytes());
        buf.put_slice(terminator.as_bytes());
        buf.freeze()
    }
}

impl fmt::Display for HardwareCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.opcode(), self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_debug_line() {
        assert_eq!(parse_frame("D:bootup"), SerialFrame::Debug("bootup".to_string()));
        assert_eq!(
            parse_frame("D:motor: stalled\r"),
            SerialFrame::Debug("motor: stalled".to_string())
        );
        assert_eq!(parse_frame("D"), SerialFrame::Debug(String::new()));
    }

    #[test]
    fn test_telemetry_line() {
        assert_eq!(
            parse_frame("P:10:20:30:40"),
            SerialFrame::Telemetry(vec![json!(10), json!(20), json!(30), json!(40)])
        );
    }

    #[test]
    fn test_telemetry_mixed_fields() {
        assert_eq!(
            parse_frame("P:-3:1.5:ok: 7 "),
            SerialFrame::Telemetry(vec![json!(-3), json!(1.5), json!("ok"), json!(7)])
        );
        assert_eq!(parse_frame("P"), SerialFrame::Telemetry(vec![]));
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(
            parse_frame("X:1:2"),
            SerialFrame::Unknown {
                opcode: "X".to_string()
            }
        );
        assert_eq!(
            parse_frame("PX:1"),
            SerialFrame::Unknown {
                opcode: "PX".to_string()
            }
        );
        assert_eq!(parse_frame(""), SerialFrame::Empty);
        assert_eq!(parse_frame("  \r"), SerialFrame::Empty);
    }

    #[test]
    fn test_command_encoding() {
        let cmd = HardwareCommand::Move("FWD".to_string());
        assert_eq!(cmd.to_string(), "MFWD");
        assert_eq!(cmd.encode("").as_ref(), b"MFWD");
        assert_eq!(
            HardwareCommand::Speed("80".to_string()).encode("\n").as_ref(),
            b"S80\n"
        );
    }
}
