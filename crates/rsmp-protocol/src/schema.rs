// Schema validation contract.
//
// Full JSON-schema content lives outside this crate; connections only need
// something that turns a record into a list of structured findings. The
// built-in `CoreShapeValidator` checks the envelope and top-level field shapes
// of the core message set.

use serde_json::Value;
use uuid::Uuid;

use crate::error::SchemaError;
use crate::message::{AlarmKind, Attributes, MessageType};

/// Schemas a connection validates against: the core version, plus the
/// application-layer (SXL) dialect once it is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSet {
    pub core: String,
    /// `(name, version)`, e.g. `("tlc", "1.2.1")`.
    pub sxl: Option<(String, String)>,
}

impl SchemaSet {
    pub fn core(version: impl Into<String>) -> Self {
        SchemaSet {
            core: version.into(),
            sxl: None,
        }
    }

    pub fn with_sxl(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.sxl = Some((name.into(), version.into()));
        self
    }
}

pub trait SchemaValidator: Send + Sync {
    /// Return every finding for one record; an empty list means valid.
    fn validate(
        &self,
        message_type: MessageType,
        attributes: &Attributes,
        schemas: &SchemaSet,
    ) -> Vec<SchemaError>;
}

/// Checks required top-level fields and their JSON types per message type.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreShapeValidator;

#[derive(Clone, Copy)]
enum Shape {
    Str,
    Array,
    Bool8,
    StrOrNull,
}

impl CoreShapeValidator {
    fn required(message_type: MessageType) -> &'static [(&'static str, Shape)] {
        use Shape::*;
        match message_type {
            MessageType::Version => &[("RSMP", Array), ("siteId", Array), ("SXL", Str)],
            MessageType::Watchdog => &[("wTs", Str)],
            MessageType::MessageAck => &[("oMId", Str)],
            MessageType::MessageNotAck => &[("oMId", Str), ("rea", Str)],
            MessageType::AggregatedStatus => &[
                ("cId", Str),
                ("aSTS", Str),
                ("fP", StrOrNull),
                ("fS", StrOrNull),
                ("se", Bool8),
            ],
            MessageType::AggregatedStatusRequest => &[("cId", Str)],
            MessageType::Alarm(kind) if kind.carries_state() => &[
                ("cId", Str),
                ("aCId", Str),
                ("aSp", Str),
                ("ack", Str),
                ("aS", Str),
                ("sS", Str),
                ("aTs", Str),
                ("cat", Str),
                ("pri", Str),
                ("rvs", Array),
            ],
            MessageType::Alarm(AlarmKind::Other) => &[("cId", Str), ("aCId", Str), ("aSp", Str)],
            MessageType::Alarm(_) => &[("cId", Str), ("aCId", Str)],
            MessageType::CommandRequest => &[("cId", Str), ("arg", Array)],
            MessageType::CommandResponse => &[("cId", Str), ("cTS", Str), ("rvs", Array)],
            MessageType::StatusRequest
            | MessageType::StatusSubscribe
            | MessageType::StatusUnsubscribe => &[("cId", Str), ("sS", Array)],
            MessageType::StatusResponse | MessageType::StatusUpdate => {
                &[("cId", Str), ("sTs", Str), ("sS", Array)]
            }
            MessageType::Unknown => &[],
        }
    }
}

impl SchemaValidator for CoreShapeValidator {
    fn validate(
        &self,
        message_type: MessageType,
        attributes: &Attributes,
        _schemas: &SchemaSet,
    ) -> Vec<SchemaError> {
        let mut errors = Vec::new();
        let mut fail = |pointer: &str, message: String| {
            errors.push(SchemaError {
                area: "core".to_owned(),
                pointer: pointer.to_owned(),
                message,
            })
        };

        if message_type == MessageType::Unknown {
            fail("/type", "unknown message type".to_owned());
        }

        if !message_type.is_acknowledgement() {
            match attributes.get("mId") {
                Some(Value::String(id)) if Uuid::parse_str(id).is_ok() => {}
                Some(Value::String(id)) => fail("/mId", format!("'{}' is not a uuid", id)),
                Some(_) => fail("/mId", "must be a string".to_owned()),
                None => fail("/mId", "is required".to_owned()),
            }
        }

        for (key, shape) in Self::required(message_type) {
            let pointer = format!("/{}", key);
            match (attributes.get(*key), shape) {
                (None, _) => fail(&pointer, "is required".to_owned()),
                (Some(Value::String(_)), Shape::Str) => {}
                (Some(Value::String(_) | Value::Null), Shape::StrOrNull) => {}
                (Some(Value::Array(_)), Shape::Array) => {}
                (Some(Value::Array(items)), Shape::Bool8)
                    if items.len() == 8 && items.iter().all(Value::is_boolean) => {}
                (Some(_), Shape::Bool8) => {
                    fail(&pointer, "must be an array of 8 booleans".to_owned())
                }
                (Some(_), Shape::Str) => fail(&pointer, "must be a string".to_owned()),
                (Some(_), Shape::StrOrNull) => {
                    fail(&pointer, "must be a string or null".to_owned())
                }
                (Some(_), Shape::Array) => fail(&pointer, "must be an array".to_owned()),
            }
        }
        errors
    }
}
