//! Components addressed by `cId`, with their statuses, alarms and aggregated
//! status. Both roles keep a [`ComponentRegistry`]: the site as the source of
//! truth, the supervisor as its view of each site.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rsmp_protocol::{CommandArg, CommandReturn, Message, Quality};
use serde::Deserialize;
use serde_json::Value;

use crate::aggregated_status::AggregatedStatus;
use crate::alarm::AlarmState;
use crate::error::MessageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Main,
    SignalGroup,
    Detector,
    #[default]
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusValue {
    pub value: Value,
    pub quality: Quality,
}

/// Executes CommandRequest arguments for one component.
pub trait CommandHandler: Send {
    fn handle(&mut self, component_id: &str, args: &[CommandArg]) -> Result<Vec<CommandReturn>, MessageError>;
}

impl<F> CommandHandler for F
where
    F: FnMut(&str, &[CommandArg]) -> Result<Vec<CommandReturn>, MessageError> + Send,
{
    fn handle(&mut self, component_id: &str, args: &[CommandArg]) -> Result<Vec<CommandReturn>, MessageError> {
        self(component_id, args)
    }
}

pub struct Component {
    id: String,
    kind: ComponentKind,
    pub aggregated_status: AggregatedStatus,
    alarms: BTreeMap<String, AlarmState>,
    statuses: BTreeMap<(String, String), StatusValue>,
    commands: Option<Box<dyn CommandHandler>>,
    stub: bool,
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("aggregated_status", &self.aggregated_status)
            .field("alarms", &self.alarms.len())
            .field("statuses", &self.statuses.len())
            .field("stub", &self.stub)
            .finish()
    }
}

impl Component {
    pub fn new(id: impl Into<String>, kind: ComponentKind) -> Self {
        Component {
            id: id.into(),
            kind,
            aggregated_status: AggregatedStatus::default(),
            alarms: BTreeMap::new(),
            statuses: BTreeMap::new(),
            commands: None,
            stub: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Created on the fly for an unknown `cId` rather than configured.
    pub fn is_stub(&self) -> bool {
        self.stub
    }

    pub fn set_command_handler(&mut self, handler: impl CommandHandler + 'static) {
        self.commands = Some(Box::new(handler));
    }

    pub fn status(&self, code: &str, name: &str) -> Option<&StatusValue> {
        self.statuses.get(&(code.to_owned(), name.to_owned()))
    }

    pub fn has_status(&self, code: &str, name: &str) -> bool {
        self.status(code, name).is_some()
    }

    /// Store a status value; returns whether the value or quality changed.
    pub fn set_status(&mut self, code: &str, name: &str, value: Value, quality: Quality) -> bool {
        let next = StatusValue { value, quality };
        let key = (code.to_owned(), name.to_owned());
        if self.statuses.get(&key) == Some(&next) {
            return false;
        }
        self.statuses.insert(key, next);
        true
    }

    /// AggregatedStatus message reporting the current bits.
    pub fn aggregated_status_message(&self, at: DateTime<Utc>) -> Message {
        let status = &self.aggregated_status;
        Message::aggregated_status(
            &self.id,
            status.bits(),
            status.functional_position.as_deref(),
            status.functional_state.as_deref(),
            at,
        )
    }

    pub fn alarm(&self, code: &str) -> Option<&AlarmState> {
        self.alarms.get(code)
    }

    pub fn alarm_mut(&mut self, code: &str) -> Result<&mut AlarmState, MessageError> {
        let component = self.id.clone();
        self.alarms
            .get_mut(code)
            .ok_or_else(|| MessageError::UnknownAlarm {
                component,
                code: code.to_owned(),
            })
    }

    /// The alarm with `code`, created inactive if it does not exist yet.
    pub fn find_or_create_alarm(&mut self, code: &str) -> &mut AlarmState {
        let id = self.id.clone();
        self.alarms
            .entry(code.to_owned())
            .or_insert_with(|| AlarmState::new(id, code))
    }

    pub fn alarms(&self) -> impl Iterator<Item = &AlarmState> {
        self.alarms.values()
    }

    pub fn handle_command(&mut self, args: &[CommandArg]) -> Result<Vec<CommandReturn>, MessageError> {
        match self.commands.as_mut() {
            Some(handler) => handler.handle(&self.id, args),
            None => Err(MessageError::UnknownCommand {
                component: self.id.clone(),
                code: args.first().map(|a| a.code.clone()).unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct ComponentRegistry {
    components: BTreeMap<String, Component>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, component: Component) {
        self.components.insert(component.id.clone(), component);
    }

    pub fn get(&self, id: &str) -> Result<&Component, MessageError> {
        self.components
            .get(id)
            .ok_or_else(|| MessageError::UnknownComponent(id.to_owned()))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Component, MessageError> {
        self.components
            .get_mut(id)
            .ok_or_else(|| MessageError::UnknownComponent(id.to_owned()))
    }

    /// Look up `id`, creating a stub component if it is unknown. The flag is
    /// `true` when the component was created.
    pub fn find_or_create(&mut self, id: &str, kind: ComponentKind) -> (&mut Component, bool) {
        let created = !self.components.contains_key(id);
        let component = self.components.entry(id.to_owned()).or_insert_with(|| {
            let mut component = Component::new(id, kind);
            component.stub = true;
            component
        });
        (component, created)
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.components.keys().cloned().collect()
    }

    pub fn main(&self) -> Option<&Component> {
        self.components
            .values()
            .find(|c| c.kind == ComponentKind::Main)
    }

    pub fn get_status(&self, component: &str, code: &str, name: &str) -> Result<StatusValue, MessageError> {
        self.get(component)?
            .status(code, name)
            .cloned()
            .ok_or_else(|| MessageError::UnknownStatus {
                component: component.to_owned(),
                code: code.to_owned(),
                name: name.to_owned(),
            })
    }

    pub fn set_status(&mut self, component: &str, code: &str, name: &str, value: Value) -> Result<bool, MessageError> {
        Ok(self
            .get_mut(component)?
            .set_status(code, name, value, Quality::Recent))
    }

    pub fn handle_command(&mut self, component: &str, args: &[CommandArg]) -> Result<Vec<CommandReturn>, MessageError> {
        self.get_mut(component)?.handle_command(args)
    }

    /// Raise an alarm, creating it if needed. Returns the alarm when its state changed.
    pub fn activate_alarm(&mut self, component: &str, code: &str) -> Result<Option<&AlarmState>, MessageError> {
        let alarm = self.get_mut(component)?.find_or_create_alarm(code);
        Ok(alarm.activate(Utc::now()).then_some(&*alarm))
    }

    pub fn deactivate_alarm(&mut self, component: &str, code: &str) -> Result<Option<&AlarmState>, MessageError> {
        let alarm = self.get_mut(component)?.alarm_mut(code)?;
        Ok(alarm.deactivate(Utc::now()).then_some(&*alarm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        let mut tc = Component::new("TC", ComponentKind::Main);
        tc.set_status("S0001", "signalgroupstatus", json!("A1"), Quality::Recent);
        registry.add(tc);
        registry
    }

    #[test]
    fn unknown_component_and_status_are_reported() {
        let registry = registry();
        assert_eq!(
            registry.get_status("XX", "S0001", "signalgroupstatus"),
            Err(MessageError::UnknownComponent("XX".to_owned()))
        );
        assert!(matches!(
            registry.get_status("TC", "S0002", "x"),
            Err(MessageError::UnknownStatus { .. })
        ));
        assert_eq!(
            registry.get_status("TC", "S0001", "signalgroupstatus").unwrap().value,
            json!("A1")
        );
    }

    #[test]
    fn set_status_reports_change() {
        let mut registry = registry();
        assert!(!registry.set_status("TC", "S0001", "signalgroupstatus", json!("A1")).unwrap());
        assert!(registry.set_status("TC", "S0001", "signalgroupstatus", json!("B1")).unwrap());
    }

    #[test]
    fn find_or_create_marks_stubs() {
        let mut registry = registry();
        let (existing, created) = registry.find_or_create("TC", ComponentKind::Other);
        assert!(!created);
        assert!(!existing.is_stub());
        let (stub, created) = registry.find_or_create("DL9", ComponentKind::Detector);
        assert!(created);
        assert!(stub.is_stub());
    }

    #[test]
    fn commands_go_to_the_component_handler() {
        let mut registry = registry();
        let args = vec![CommandArg {
            code: "M0001".to_owned(),
            name: "status".to_owned(),
            operation: "setValue".to_owned(),
            value: json!("NormalControl"),
        }];
        assert!(matches!(
            registry.handle_command("TC", &args),
            Err(MessageError::UnknownCommand { .. })
        ));

        registry
            .get_mut("TC")
            .unwrap()
            .set_command_handler(|_: &str, args: &[CommandArg]| -> Result<Vec<CommandReturn>, MessageError> {
                Ok(args
                    .iter()
                    .map(|a| CommandReturn {
                        code: a.code.clone(),
                        name: a.name.clone(),
                        value: a.value.clone(),
                        age: "recent".to_owned(),
                    })
                    .collect())
            });
        let returns = registry.handle_command("TC", &args).unwrap();
        assert_eq!(returns[0].value, json!("NormalControl"));
    }

    #[test]
    fn alarm_activation_is_reported_once() {
        let mut registry = registry();
        assert!(registry.activate_alarm("TC", "A0001").unwrap().is_some());
        assert!(registry.activate_alarm("TC", "A0001").unwrap().is_none());
        assert!(registry.deactivate_alarm("TC", "A0001").unwrap().is_some());
        assert!(matches!(
            registry.deactivate_alarm("TC", "A9999"),
            Err(MessageError::UnknownAlarm { .. })
        ));
    }
}
