use std::fmt;

/// One structured finding from a schema validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    /// Protocol area the rule belongs to, e.g. `core` or `tlc`.
    pub area: String,
    /// JSON pointer of the offending value (`""` for the record itself).
    pub pointer: String,
    pub message: String,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pointer.is_empty() {
            write!(f, "[{}] {}", self.area, self.message)
        } else {
            write!(f, "[{}] {}: {}", self.area, self.pointer, self.message)
        }
    }
}

/// Errors raised while decoding, building or validating a single record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    /// The bytes are not JSON at all.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
    /// Valid JSON, but not an RSMP envelope. Carries the decoded value when
    /// there was one so it can still be logged.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        attributes: Option<serde_json::Value>,
    },
    #[error("{0}")]
    MissingAttribute(String),
    /// Enveloped correctly but breaks a protocol rule.
    #[error("{0}")]
    InvalidMessage(String),
    #[error("{}", join_schema_errors(.0))]
    Schema(Vec<SchemaError>),
    #[error("RSMP versions [{}] requested, but only [{}] supported", .requested.join(", "), .supported.join(", "))]
    UnsupportedVersion {
        requested: Vec<String>,
        supported: Vec<String>,
    },
}

fn join_schema_errors(errors: &[SchemaError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>, attributes: &serde_json::Value) -> Self {
        ProtocolError::MalformedMessage {
            reason: reason.into(),
            attributes: Some(attributes.clone()),
        }
    }
}
