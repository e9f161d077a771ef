//! Error types for the relay core.

use thiserror::Error;

/// A client frame that could not be turned into a [`Message`](crate::ws::Message).
///
/// Always recoverable: the frame is dropped and the connection stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame has an empty type tag")]
    EmptyType,

    #[error("'{kind}' requires a scalar value, got {found}")]
    NonScalarValue { kind: &'static str, found: &'static str },

    #[error("'{kind}' value {value:?} is not printable ASCII")]
    InvalidCommandValue { kind: &'static str, value: String },
}

/// Errors raised by the hardware link.
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("failed to open serial device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial device closed the connection")]
    Closed,

    #[error("serial link is not connected")]
    NotConnected,

    #[error("gave up opening the serial device after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl SerialError {
    /// Whether the error means the port itself is gone and must be reopened.
    pub fn is_fatal_for_port(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Closed | Self::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_from_json() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let proto: ProtocolError = err.into();
        assert!(matches!(proto, ProtocolError::Malformed(_)));
        assert!(proto.to_string().starts_with("malformed frame"));
    }

    #[test]
    fn test_serial_error_port_fatality() {
        assert!(SerialError::Closed.is_fatal_for_port());
        assert!(SerialError::Io(std::io::Error::other("boom")).is_fatal_for_port());
        assert!(!SerialError::RetriesExhausted { attempts: 3 }.is_fatal_for_port());
    }
}
