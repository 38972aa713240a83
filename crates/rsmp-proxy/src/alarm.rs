use chrono::{DateTime, Utc};
use rsmp_protocol::{AlarmFields, AlarmKind, AlarmReturnValue, Message};
use serde_json::Value;

use crate::error::MessageError;

/// State of one alarm on one component.
///
/// Changes go through the transition methods, which return whether the state
/// actually changed and only then move the timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmState {
    component_id: String,
    code: String,
    active: bool,
    suspended: bool,
    acknowledged: bool,
    category: String,
    priority: u8,
    timestamp: DateTime<Utc>,
    return_values: Vec<AlarmReturnValue>,
}

impl AlarmState {
    pub fn new(component_id: impl Into<String>, code: impl Into<String>) -> Self {
        AlarmState {
            component_id: component_id.into(),
            code: code.into(),
            active: false,
            suspended: false,
            acknowledged: false,
            category: "D".to_owned(),
            priority: 2,
            timestamp: Utc::now(),
            return_values: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>, priority: u8) -> Self {
        self.category = category.into();
        self.priority = priority;
        self
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn return_values(&self) -> &[AlarmReturnValue] {
        &self.return_values
    }

    fn transition(&mut self, now: DateTime<Utc>, change: impl FnOnce(&mut Self) -> bool) -> bool {
        let changed = change(self);
        if changed {
            self.timestamp = now;
        }
        changed
    }

    pub fn suspend(&mut self, now: DateTime<Utc>) -> bool {
        self.transition(now, |s| !std::mem::replace(&mut s.suspended, true))
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        self.transition(now, |s| std::mem::replace(&mut s.suspended, false))
    }

    /// Raise the alarm. A newly raised alarm needs a fresh acknowledgement.
    pub fn activate(&mut self, now: DateTime<Utc>) -> bool {
        self.transition(now, |s| {
            if s.active {
                return false;
            }
            s.active = true;
            s.acknowledged = false;
            true
        })
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) -> bool {
        self.transition(now, |s| std::mem::replace(&mut s.active, false))
    }

    pub fn acknowledge(&mut self, now: DateTime<Utc>) -> bool {
        self.transition(now, |s| !std::mem::replace(&mut s.acknowledged, true))
    }

    pub fn set_return_values(&mut self, values: Vec<AlarmReturnValue>) {
        self.return_values = values;
    }

    pub fn fields(&self) -> AlarmFields {
        AlarmFields {
            active: self.active,
            suspended: self.suspended,
            acknowledged: self.acknowledged,
            category: self.category.clone(),
            priority: self.priority,
            timestamp: self.timestamp,
            return_values: self.return_values.clone(),
        }
    }

    /// An Alarm message reporting this state.
    pub fn to_message(&self, kind: AlarmKind) -> Message {
        Message::alarm(kind, &self.component_id, &self.code, Some(&self.fields()))
    }

    /// Take over the state reported by a peer's Alarm message. Returns whether
    /// anything changed.
    pub fn apply(&mut self, message: &Message) -> Result<bool, MessageError> {
        let text = |key: &str| -> Result<String, MessageError> {
            message
                .attribute(key)?
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| MessageError::Invalid(format!("{} must be a string", key)))
        };
        let active = text("aS")?.eq_ignore_ascii_case("active");
        let suspended = text("sS")?.eq_ignore_ascii_case("suspended");
        let acknowledged = text("ack")?.eq_ignore_ascii_case("acknowledged");
        let timestamp = DateTime::parse_from_rfc3339(&text("aTs")?)
            .map_err(|e| MessageError::Invalid(format!("invalid aTs: {}", e)))?
            .with_timezone(&Utc);
        let category = text("cat")?;
        let priority = text("pri")?
            .parse::<u8>()
            .map_err(|e| MessageError::Invalid(format!("invalid pri: {}", e)))?;
        let return_values = match message.attributes().get("rvs") {
            Some(Value::Array(_)) => message.items("rvs")?,
            _ => Vec::new(),
        };

        let next = AlarmState {
            component_id: self.component_id.clone(),
            code: self.code.clone(),
            active,
            suspended,
            acknowledged,
            category,
            priority,
            timestamp,
            return_values,
        };
        if *self == next {
            return Ok(false);
        }
        *self = next;
        Ok(true)
    }
}
