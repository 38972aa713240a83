//! The RSMP message model.
//!
//! A [`Message`] keeps the full attribute map in wire order (so a received
//! record re-serializes to the same JSON) together with a [`MessageType`]
//! tag that is decided exactly once, when the message is built.
//!
//! # Lifecycle
//! - Received: [`Message::parse_attributes`] then [`Message::build`]; the
//!   direction is set to [`Direction::In`].
//! - Sent: one of the constructors (`Message::watchdog`, `Message::status_request`,
//!   ...); the connection sets [`Direction::Out`] when it writes the record.
//!
//! Acknowledgements never carry their own `mId`; they point at the message they
//! acknowledge through `oMId` (see [`Message::ack_for`]).

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::items::{
    AlarmReturnValue, CommandArg, CommandReturn, Quality, SiteIdEntry, StatusItem, StatusRef,
    SubscribeItem, VersionEntry,
};
use crate::schema::{SchemaSet, SchemaValidator};

/// Ordered attribute map of one record.
pub type Attributes = Map<String, Value>;

/// Value of the `mType` envelope field.
pub const M_TYPE: &str = "rSMsg";

/// Format a timestamp the way RSMP puts it on the wire, e.g. `2015-06-08T11:49:03.293Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

/// Sub-kind of an `Alarm` message, derived from `aSp` and the ack/suspend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmKind {
    Issue,
    Request,
    Acknowledge,
    Acknowledged,
    Suspend,
    Suspended,
    Resume,
    Resumed,
    /// `aSp` absent or not recognized.
    Other,
}

impl AlarmKind {
    /// The `aSp` value a message of this kind carries.
    pub fn specialization(self) -> &'static str {
        match self {
            AlarmKind::Issue | AlarmKind::Other => "Issue",
            AlarmKind::Request => "Request",
            AlarmKind::Acknowledge | AlarmKind::Acknowledged => "Acknowledge",
            AlarmKind::Suspend | AlarmKind::Suspended | AlarmKind::Resumed => "Suspend",
            AlarmKind::Resume => "Resume",
        }
    }

    /// Kinds that report alarm state (as opposed to asking for a change).
    pub fn carries_state(self) -> bool {
        matches!(
            self,
            AlarmKind::Issue | AlarmKind::Acknowledged | AlarmKind::Suspended | AlarmKind::Resumed
        )
    }

    fn classify(attributes: &Attributes) -> AlarmKind {
        let field = |key: &str| attributes.get(key).and_then(Value::as_str).unwrap_or("");
        let asp = field("aSp");
        if asp.eq_ignore_ascii_case("issue") {
            AlarmKind::Issue
        } else if asp.eq_ignore_ascii_case("request") {
            AlarmKind::Request
        } else if asp.eq_ignore_ascii_case("acknowledge") {
            if field("ack").eq_ignore_ascii_case("acknowledged") {
                AlarmKind::Acknowledged
            } else {
                AlarmKind::Acknowledge
            }
        } else if asp.eq_ignore_ascii_case("suspend") {
            let suspend_state = field("sS");
            if suspend_state.eq_ignore_ascii_case("suspended") {
                AlarmKind::Suspended
            } else if suspend_state.eq_ignore_ascii_case("notsuspended") {
                AlarmKind::Resumed
            } else {
                AlarmKind::Suspend
            }
        } else if asp.eq_ignore_ascii_case("resume") {
            AlarmKind::Resume
        } else {
            AlarmKind::Other
        }
    }
}

/// Closed set of message variants. `Unknown` is a well-formed record whose
/// `type` is not part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Version,
    Watchdog,
    MessageAck,
    MessageNotAck,
    AggregatedStatus,
    AggregatedStatusRequest,
    Alarm(AlarmKind),
    CommandRequest,
    CommandResponse,
    StatusRequest,
    StatusResponse,
    StatusSubscribe,
    StatusUnsubscribe,
    StatusUpdate,
    Unknown,
}

impl MessageType {
    /// The single place where `type` strings map onto variants.
    pub fn classify(type_name: &str, attributes: &Attributes) -> MessageType {
        match type_name {
            "Version" => MessageType::Version,
            "Watchdog" => MessageType::Watchdog,
            "MessageAck" => MessageType::MessageAck,
            "MessageNotAck" => MessageType::MessageNotAck,
            "AggregatedStatus" => MessageType::AggregatedStatus,
            "AggregatedStatusRequest" => MessageType::AggregatedStatusRequest,
            "Alarm" => MessageType::Alarm(AlarmKind::classify(attributes)),
            "CommandRequest" => MessageType::CommandRequest,
            "CommandResponse" => MessageType::CommandResponse,
            "StatusRequest" => MessageType::StatusRequest,
            "StatusResponse" => MessageType::StatusResponse,
            "StatusSubscribe" => MessageType::StatusSubscribe,
            "StatusUnsubscribe" => MessageType::StatusUnsubscribe,
            "StatusUpdate" => MessageType::StatusUpdate,
            _ => MessageType::Unknown,
        }
    }

    /// Wire name. `Unknown` has no fixed name; use [`Message::type_name`] for it.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Version => "Version",
            MessageType::Watchdog => "Watchdog",
            MessageType::MessageAck => "MessageAck",
            MessageType::MessageNotAck => "MessageNotAck",
            MessageType::AggregatedStatus => "AggregatedStatus",
            MessageType::AggregatedStatusRequest => "AggregatedStatusRequest",
            MessageType::Alarm(_) => "Alarm",
            MessageType::CommandRequest => "CommandRequest",
            MessageType::CommandResponse => "CommandResponse",
            MessageType::StatusRequest => "StatusRequest",
            MessageType::StatusResponse => "StatusResponse",
            MessageType::StatusSubscribe => "StatusSubscribe",
            MessageType::StatusUnsubscribe => "StatusUnsubscribe",
            MessageType::StatusUpdate => "StatusUpdate",
            MessageType::Unknown => "Unknown",
        }
    }

    /// MessageAck and MessageNotAck: never acknowledged, never carry an `mId`.
    pub fn is_acknowledgement(self) -> bool {
        matches!(self, MessageType::MessageAck | MessageType::MessageNotAck)
    }
}

/// State fields of an alarm message that reports alarm state.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmFields {
    pub active: bool,
    pub suspended: bool,
    pub acknowledged: bool,
    /// `T` (technical) or `D` (operational).
    pub category: String,
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
    pub return_values: Vec<AlarmReturnValue>,
}

/// One RSMP message.
#[derive(Debug, Clone)]
pub struct Message {
    message_type: MessageType,
    attributes: Attributes,
    direction: Option<Direction>,
    timestamp: DateTime<Utc>,
    raw: Option<String>,
}

impl Message {
    // -----------------------------------------------------------------------
    // Decoding
    // -----------------------------------------------------------------------

    /// Decode the JSON of one record. Any JSON value is accepted here; whether
    /// it is a usable envelope is decided by [`Message::build`].
    pub fn parse_attributes(bytes: &[u8]) -> Result<Value, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::InvalidPacket(e.to_string()))
    }

    /// Build a received message from decoded JSON.
    pub fn build(value: Value, raw: &[u8]) -> Result<Message, ProtocolError> {
        let attributes = match value {
            Value::Object(map) => map,
            other => {
                return Err(ProtocolError::malformed(
                    "record is not a JSON object",
                    &other,
                ));
            }
        };
        let classified =
            envelope_type(&attributes).map(|type_name| MessageType::classify(type_name, &attributes));
        let message_type = match classified {
            Ok(message_type) => message_type,
            Err(reason) => {
                return Err(ProtocolError::malformed(reason, &Value::Object(attributes)));
            }
        };
        Ok(Message {
            message_type,
            attributes,
            direction: Some(Direction::In),
            timestamp: Utc::now(),
            raw: Some(String::from_utf8_lossy(raw).into_owned()),
        })
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Assemble an outgoing message. `mType`, `type` and (except for
    /// acknowledgements) a fresh `mId` come first, then `fields` in order.
    pub fn from_fields(type_name: &str, fields: Attributes) -> Message {
        let mut attributes = Attributes::new();
        attributes.insert("mType".to_owned(), Value::from(M_TYPE));
        attributes.insert("type".to_owned(), Value::from(type_name));
        let message_type = MessageType::classify(type_name, &fields);
        if !message_type.is_acknowledgement() {
            attributes.insert("mId".to_owned(), Value::from(Uuid::new_v4().to_string()));
        }
        for (key, value) in fields {
            attributes.insert(key, value);
        }
        Message {
            message_type,
            attributes,
            direction: None,
            timestamp: Utc::now(),
            raw: None,
        }
    }

    pub fn version(site_ids: &[String], core_versions: &[String], sxl_version: &str) -> Message {
        let mut fields = Attributes::new();
        fields.insert(
            "RSMP".to_owned(),
            to_value(
                &core_versions
                    .iter()
                    .map(|v| VersionEntry { version: v.clone() })
                    .collect::<Vec<_>>(),
            ),
        );
        fields.insert(
            "siteId".to_owned(),
            to_value(
                &site_ids
                    .iter()
                    .map(|s| SiteIdEntry { site_id: s.clone() })
                    .collect::<Vec<_>>(),
            ),
        );
        fields.insert("SXL".to_owned(), Value::from(sxl_version));
        Message::from_fields("Version", fields)
    }

    pub fn watchdog(at: DateTime<Utc>) -> Message {
        let mut fields = Attributes::new();
        fields.insert("wTs".to_owned(), Value::from(format_timestamp(at)));
        Message::from_fields("Watchdog", fields)
    }

    /// MessageAck for `original`, linked through `oMId`.
    pub fn ack_for(original: &Message) -> Result<Message, ProtocolError> {
        let m_id = original.required_m_id()?;
        let mut fields = Attributes::new();
        fields.insert("oMId".to_owned(), Value::from(m_id));
        Ok(Message::from_fields("MessageAck", fields))
    }

    /// MessageNotAck for `original` with a reason (`rea`).
    pub fn not_ack_for(original: &Message, reason: &str) -> Result<Message, ProtocolError> {
        let m_id = original.required_m_id()?;
        let mut fields = Attributes::new();
        fields.insert("oMId".to_owned(), Value::from(m_id));
        fields.insert("rea".to_owned(), Value::from(reason));
        Ok(Message::from_fields("MessageNotAck", fields))
    }

    pub fn aggregated_status(
        component_id: &str,
        bits: [bool; 8],
        functional_position: Option<&str>,
        functional_state: Option<&str>,
        at: DateTime<Utc>,
    ) -> Message {
        let mut fields = addressed(component_id);
        fields.insert("aSTS".to_owned(), Value::from(format_timestamp(at)));
        fields.insert(
            "fP".to_owned(),
            functional_position.map_or(Value::Null, Value::from),
        );
        fields.insert(
            "fS".to_owned(),
            functional_state.map_or(Value::Null, Value::from),
        );
        fields.insert("se".to_owned(), Value::from(bits.to_vec()));
        Message::from_fields("AggregatedStatus", fields)
    }

    pub fn aggregated_status_request(component_id: &str) -> Message {
        Message::from_fields("AggregatedStatusRequest", addressed(component_id))
    }

    /// Alarm message. `fields` is required for the state-carrying kinds
    /// (Issue, Acknowledged, Suspended, Resumed) and ignored for requests.
    pub fn alarm(
        kind: AlarmKind,
        component_id: &str,
        alarm_code: &str,
        fields: Option<&AlarmFields>,
    ) -> Message {
        let mut attributes = addressed(component_id);
        attributes.insert("aCId".to_owned(), Value::from(alarm_code));
        attributes.insert("xACId".to_owned(), Value::from(""));
        attributes.insert("xNACId".to_owned(), Value::from(""));
        attributes.insert("aSp".to_owned(), Value::from(kind.specialization()));
        if let Some(state) = fields.filter(|_| kind.carries_state()) {
            let ack = if state.acknowledged {
                "Acknowledged"
            } else {
                "notAcknowledged"
            };
            let active = if state.active { "Active" } else { "inActive" };
            let suspended = if state.suspended {
                "suspended"
            } else {
                "notSuspended"
            };
            attributes.insert("ack".to_owned(), Value::from(ack));
            attributes.insert("aS".to_owned(), Value::from(active));
            attributes.insert("sS".to_owned(), Value::from(suspended));
            attributes.insert(
                "aTs".to_owned(),
                Value::from(format_timestamp(state.timestamp)),
            );
            attributes.insert("cat".to_owned(), Value::from(state.category.as_str()));
            attributes.insert("pri".to_owned(), Value::from(state.priority.to_string()));
            attributes.insert("rvs".to_owned(), to_value(&state.return_values));
        }
        Message::from_fields("Alarm", attributes)
    }

    pub fn status_request(component_id: &str, items: &[StatusRef]) -> Message {
        let mut fields = addressed(component_id);
        fields.insert("sS".to_owned(), to_value(items));
        Message::from_fields("StatusRequest", fields)
    }

    pub fn status_response(component_id: &str, items: &[StatusItem], at: DateTime<Utc>) -> Message {
        Message::status_values("StatusResponse", component_id, items, at)
    }

    pub fn status_update(component_id: &str, items: &[StatusItem], at: DateTime<Utc>) -> Message {
        Message::status_values("StatusUpdate", component_id, items, at)
    }

    fn status_values(
        type_name: &str,
        component_id: &str,
        items: &[StatusItem],
        at: DateTime<Utc>,
    ) -> Message {
        let mut fields = addressed(component_id);
        fields.insert("sTs".to_owned(), Value::from(format_timestamp(at)));
        fields.insert("sS".to_owned(), to_value(items));
        Message::from_fields(type_name, fields)
    }

    pub fn status_subscribe(component_id: &str, items: &[SubscribeItem]) -> Message {
        let mut fields = addressed(component_id);
        fields.insert("sS".to_owned(), to_value(items));
        Message::from_fields("StatusSubscribe", fields)
    }

    pub fn status_unsubscribe(component_id: &str, items: &[StatusRef]) -> Message {
        let mut fields = addressed(component_id);
        fields.insert("sS".to_owned(), to_value(items));
        Message::from_fields("StatusUnsubscribe", fields)
    }

    pub fn command_request(component_id: &str, args: &[CommandArg]) -> Message {
        let mut fields = addressed(component_id);
        fields.insert("arg".to_owned(), to_value(args));
        Message::from_fields("CommandRequest", fields)
    }

    pub fn command_response(
        component_id: &str,
        returns: &[CommandReturn],
        at: DateTime<Utc>,
    ) -> Message {
        let mut fields = addressed(component_id);
        fields.insert("cTS".to_owned(), Value::from(format_timestamp(at)));
        fields.insert("rvs".to_owned(), to_value(returns));
        Message::from_fields("CommandResponse", fields)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The `type` string as it appears in the record.
    pub fn type_name(&self) -> &str {
        self.attributes
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(self.message_type.as_str())
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    /// Set the direction. Returns `false` (and leaves the message untouched)
    /// when a direction was already assigned.
    pub fn set_direction(&mut self, direction: Direction) -> bool {
        if self.direction.is_some() {
            return false;
        }
        self.direction = Some(direction);
        true
    }

    /// When the message was built or received.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Exact-key attribute lookup.
    ///
    /// A key that only differs in case is reported by name instead of being
    /// matched, so a misbehaving peer shows up clearly in the logs.
    pub fn attribute(&self, key: &str) -> Result<&Value, ProtocolError> {
        if let Some(value) = self.attributes.get(key) {
            return Ok(value);
        }
        match self
            .attributes
            .keys()
            .find(|candidate| candidate.eq_ignore_ascii_case(key))
        {
            Some(found) => Err(ProtocolError::MissingAttribute(format!(
                "attribute '{}' should be named '{}'",
                found, key
            ))),
            None => Err(ProtocolError::MissingAttribute(format!(
                "missing attribute '{}'",
                key
            ))),
        }
    }

    fn string_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn m_id(&self) -> Option<&str> {
        self.string_attribute("mId")
    }

    /// First four characters of the id, the short form used in logs.
    pub fn m_id_short(&self) -> &str {
        let id = self.m_id().or(self.original_m_id()).unwrap_or("");
        id.get(..4).unwrap_or(id)
    }

    fn required_m_id(&self) -> Result<&str, ProtocolError> {
        self.attribute("mId")?
            .as_str()
            .ok_or_else(|| ProtocolError::InvalidMessage("mId is not a string".to_owned()))
    }

    /// `oMId` of an acknowledgement.
    pub fn original_m_id(&self) -> Option<&str> {
        self.string_attribute("oMId")
    }

    /// `cId`, the addressed component.
    pub fn component_id(&self) -> Option<&str> {
        self.string_attribute("cId")
    }

    /// `rea` of a MessageNotAck.
    pub fn reason(&self) -> Option<&str> {
        self.string_attribute("rea")
    }

    /// `aCId` of an Alarm.
    pub fn alarm_code(&self) -> Option<&str> {
        self.string_attribute("aCId")
    }

    pub fn sxl_version(&self) -> Option<&str> {
        self.string_attribute("SXL")
    }

    pub fn core_versions(&self) -> Result<Vec<String>, ProtocolError> {
        let entries: Vec<VersionEntry> = self.items("RSMP")?;
        Ok(entries.into_iter().map(|e| e.version).collect())
    }

    pub fn site_ids(&self) -> Result<Vec<String>, ProtocolError> {
        let entries: Vec<SiteIdEntry> = self.items("siteId")?;
        Ok(entries.into_iter().map(|e| e.site_id).collect())
    }

    pub fn status_refs(&self) -> Result<Vec<StatusRef>, ProtocolError> {
        self.items("sS")
    }

    pub fn status_items(&self) -> Result<Vec<StatusItem>, ProtocolError> {
        self.items("sS")
    }

    pub fn subscribe_items(&self) -> Result<Vec<SubscribeItem>, ProtocolError> {
        self.items("sS")
    }

    pub fn command_args(&self) -> Result<Vec<CommandArg>, ProtocolError> {
        self.items("arg")
    }

    pub fn command_returns(&self) -> Result<Vec<CommandReturn>, ProtocolError> {
        self.items("rvs")
    }

    /// Deserialize a list payload into its typed items.
    pub fn items<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, ProtocolError> {
        let value = self.attribute(key)?;
        serde_json::from_value(value.clone()).map_err(|e| {
            ProtocolError::InvalidMessage(format!("invalid {} in {}: {}", key, self.type_name(), e))
        })
    }

    // -----------------------------------------------------------------------
    // Wire form, validation
    // -----------------------------------------------------------------------

    /// Compact, deterministic JSON of the attribute map (no delimiter).
    pub fn to_json(&self) -> String {
        // serde_json's compact writer emits no insignificant whitespace and,
        // with `preserve_order`, keeps insertion order.
        Value::Object(self.attributes.clone()).to_string()
    }

    /// The record exactly as received, if this message came off the wire.
    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub fn validate(
        &self,
        validator: &dyn SchemaValidator,
        schemas: &SchemaSet,
    ) -> Result<(), ProtocolError> {
        let errors = validator.validate(self.message_type, &self.attributes, schemas);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Schema(errors))
        }
    }

    /// Copy of a status message whose `recent` values are marked `old`.
    ///
    /// Used for updates that could not be sent while the connection was down.
    pub fn with_downgraded_quality(&self) -> Message {
        let mut copy = self.clone();
        if let Some(Value::Array(items)) = copy.attributes.get_mut("sS") {
            for item in items.iter_mut() {
                if let Some(quality) = item.get_mut("q") {
                    if quality.as_str() == Some(Quality::Recent.as_str()) {
                        *quality = Value::from(Quality::Old.as_str());
                    }
                }
            }
        }
        copy
    }
}

/// Check `mType` and return the `type` string.
fn envelope_type(attributes: &Attributes) -> Result<&str, String> {
    match attributes.get("mType") {
        Some(Value::String(m_type)) if m_type == M_TYPE => {}
        Some(Value::String(m_type)) => return Err(format!("invalid mType '{}'", m_type)),
        Some(_) => return Err("mType is not a string".to_owned()),
        None => return Err("missing mType".to_owned()),
    }
    match attributes.get("type") {
        Some(Value::String(type_name)) => Ok(type_name),
        Some(_) => Err("type is not a string".to_owned()),
        None => Err("missing type".to_owned()),
    }
}

fn addressed(component_id: &str) -> Attributes {
    let mut fields = Attributes::new();
    fields.insert("ntsOId".to_owned(), Value::from(""));
    fields.insert("xNId".to_owned(), Value::from(""));
    fields.insert("cId".to_owned(), Value::from(component_id));
    fields
}

fn to_value<T: Serialize + ?Sized>(items: &T) -> Value {
    // Item types are plain derive(Serialize) structs with string keys.
    serde_json::to_value(items).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn received(value: Value) -> Result<Message, ProtocolError> {
        let raw = value.to_string();
        Message::build(Message::parse_attributes(raw.as_bytes())?, raw.as_bytes())
    }

    #[test]
    fn build_resolves_type_and_marks_ingoing() {
        let msg = received(json!({"mType": "rSMsg", "type": "Watchdog", "mId": "abcd-1", "wTs": "x"}))
            .unwrap();
        assert_eq!(msg.message_type(), MessageType::Watchdog);
        assert_eq!(msg.direction(), Some(Direction::In));
        assert_eq!(msg.m_id(), Some("abcd-1"));
    }

    #[test]
    fn unrecognized_type_builds_unknown() {
        let msg = received(json!({"mType": "rSMsg", "type": "Frobnicate", "mId": "1"})).unwrap();
        assert_eq!(msg.message_type(), MessageType::Unknown);
        assert_eq!(msg.type_name(), "Frobnicate");
    }

    #[test]
    fn invalid_json_is_an_invalid_packet() {
        assert!(matches!(
            Message::parse_attributes(b"{not json"),
            Err(ProtocolError::InvalidPacket(_))
        ));
    }

    #[test]
    fn scalar_json_parses_but_does_not_build() {
        let value = Message::parse_attributes(b"42").unwrap();
        assert!(matches!(
            Message::build(value, b"42"),
            Err(ProtocolError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn envelope_violations_are_malformed() {
        for value in [
            json!({"type": "Watchdog"}),
            json!({"mType": "other", "type": "Watchdog"}),
            json!({"mType": 1, "type": "Watchdog"}),
            json!({"mType": "rSMsg"}),
            json!({"mType": "rSMsg", "type": 5}),
        ] {
            let err = received(value.clone()).unwrap_err();
            assert!(
                matches!(err, ProtocolError::MalformedMessage { .. }),
                "{value} gave {err:?}"
            );
        }
    }

    #[test]
    fn alarm_sub_kinds_are_case_insensitive() {
        let cases = [
            (json!({"aSp": "issue"}), AlarmKind::Issue),
            (json!({"aSp": "Request"}), AlarmKind::Request),
            (json!({"aSp": "Acknowledge"}), AlarmKind::Acknowledge),
            (
                json!({"aSp": "ACKNOWLEDGE", "ack": "acknowledged"}),
                AlarmKind::Acknowledged,
            ),
            (json!({"aSp": "Suspend"}), AlarmKind::Suspend),
            (json!({"aSp": "suspend", "sS": "Suspended"}), AlarmKind::Suspended),
            (json!({"aSp": "Suspend", "sS": "notSuspended"}), AlarmKind::Resumed),
            (json!({"aSp": "resume"}), AlarmKind::Resume),
            (json!({}), AlarmKind::Other),
        ];
        for (extra, expected) in cases {
            let mut value = json!({"mType": "rSMsg", "type": "Alarm", "mId": "1"});
            for (k, v) in extra.as_object().unwrap() {
                value[k] = v.clone();
            }
            let msg = received(value).unwrap();
            assert_eq!(msg.message_type(), MessageType::Alarm(expected));
        }
    }

    #[test]
    fn attribute_reports_wrongly_cased_key() {
        let msg = received(json!({"mType": "rSMsg", "type": "StatusRequest", "mId": "1", "cid": "TC"}))
            .unwrap();
        let err = msg.attribute("cId").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MissingAttribute("attribute 'cid' should be named 'cId'".to_owned())
        );
        let err = msg.attribute("sS").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MissingAttribute("missing attribute 'sS'".to_owned())
        );
    }

    #[test]
    fn ack_links_to_original_and_has_no_m_id() {
        let original = Message::watchdog(Utc::now());
        let ack = Message::ack_for(&original).unwrap();
        assert_eq!(ack.message_type(), MessageType::MessageAck);
        assert_eq!(ack.m_id(), None);
        assert_eq!(ack.original_m_id(), original.m_id());

        let not_ack = Message::not_ack_for(&original, "nope").unwrap();
        assert_eq!(not_ack.original_m_id(), original.m_id());
        assert_eq!(not_ack.reason(), Some("nope"));
    }

    #[test]
    fn ack_of_message_without_m_id_fails() {
        let ack = Message::ack_for(&Message::watchdog(Utc::now())).unwrap();
        assert!(matches!(
            Message::ack_for(&ack),
            Err(ProtocolError::MissingAttribute(_))
        ));
    }

    #[test]
    fn wire_form_is_compact_and_ordered() {
        let at = DateTime::parse_from_rfc3339("2024-01-02T03:04:05.678Z")
            .unwrap()
            .with_timezone(&Utc);
        let msg = Message::watchdog(at);
        let json = msg.to_json();
        let m_id = msg.m_id().unwrap();
        assert_eq!(
            json,
            format!(
                r#"{{"mType":"rSMsg","type":"Watchdog","mId":"{}","wTs":"2024-01-02T03:04:05.678Z"}}"#,
                m_id
            )
        );
    }

    #[test]
    fn direction_is_set_once() {
        let mut msg = Message::watchdog(Utc::now());
        assert!(msg.set_direction(Direction::Out));
        assert!(!msg.set_direction(Direction::In));
        assert_eq!(msg.direction(), Some(Direction::Out));
    }

    #[test]
    fn outgoing_alarm_constructor_classifies_like_the_parser() {
        let fields = AlarmFields {
            active: true,
            suspended: true,
            acknowledged: false,
            category: "D".to_owned(),
            priority: 2,
            timestamp: Utc::now(),
            return_values: vec![],
        };
        let msg = Message::alarm(AlarmKind::Suspended, "TC", "A0301", Some(&fields));
        assert_eq!(msg.message_type(), MessageType::Alarm(AlarmKind::Suspended));
        let request = Message::alarm(AlarmKind::Suspend, "TC", "A0301", None);
        assert_eq!(request.message_type(), MessageType::Alarm(AlarmKind::Suspend));
        assert!(request.attributes().get("sS").is_none());
    }

    #[test]
    fn downgraded_copy_marks_recent_values_old() {
        let msg = Message::status_update(
            "TC",
            &[
                StatusItem {
                    code: "S0001".to_owned(),
                    name: "a".to_owned(),
                    value: json!("1"),
                    quality: Quality::Recent,
                },
                StatusItem {
                    code: "S0002".to_owned(),
                    name: "b".to_owned(),
                    value: json!("2"),
                    quality: Quality::Undefined,
                },
            ],
            Utc::now(),
        );
        let copy = msg.with_downgraded_quality();
        let items = copy.status_items().unwrap();
        assert_eq!(items[0].quality, Quality::Old);
        assert_eq!(items[1].quality, Quality::Undefined);
        assert_eq!(msg.status_items().unwrap()[0].quality, Quality::Recent);
        assert_eq!(copy.m_id(), msg.m_id());
    }
}
