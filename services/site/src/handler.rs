//! Site side of a supervisor connection: answers requests from the component
//! registry and drives status subscriptions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rsmp_protocol::{AlarmKind, Message, MessageType, StatusItem};
use rsmp_proxy::{
    ComponentRegistry, MessageError, MessageFault, Outbox, ProxyError, ProxySettings, Role,
    RoleHandler,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::subscriptions::Subscriptions;

pub type SharedRegistry = Arc<Mutex<ComponentRegistry>>;

pub(crate) fn lock(registry: &SharedRegistry) -> MutexGuard<'_, ComponentRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One per connection; the registry is shared by every connection of the site.
pub struct SiteHandler {
    registry: SharedRegistry,
    subscriptions: Subscriptions,
}

impl SiteHandler {
    pub fn new(registry: SharedRegistry) -> Self {
        SiteHandler {
            registry,
            subscriptions: Subscriptions::new(),
        }
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    fn component_id(message: &Message) -> Result<&str, MessageError> {
        message
            .component_id()
            .ok_or_else(|| MessageError::Invalid("missing attribute 'cId'".to_owned()))
    }

    fn aggregated_status_request(&self, message: &Message, outbox: &mut Outbox) -> Result<(), MessageError> {
        let registry = lock(&self.registry);
        let component = registry.get(Self::component_id(message)?)?;
        outbox.push(component.aggregated_status_message(Utc::now()));
        Ok(())
    }

    fn status_request(&self, message: &Message, outbox: &mut Outbox) -> Result<(), MessageError> {
        let component = Self::component_id(message)?;
        let refs = message.status_refs()?;
        let registry = lock(&self.registry);
        let mut items = Vec::with_capacity(refs.len());
        for item in refs {
            let status = registry.get_status(component, &item.code, &item.name)?;
            items.push(StatusItem {
                code: item.code,
                name: item.name,
                value: status.value,
                quality: status.quality,
            });
        }
        outbox.push(Message::status_response(component, &items, Utc::now()));
        Ok(())
    }

    fn status_subscribe(&mut self, message: &Message) -> Result<(), MessageError> {
        let component = Self::component_id(message)?;
        let items = message.subscribe_items()?;
        {
            let registry = lock(&self.registry);
            for item in &items {
                registry.get_status(component, &item.code, &item.name)?;
            }
        }
        self.subscriptions.subscribe(component, &items)?;
        debug!(component, count = items.len(), "status subscription added");
        Ok(())
    }

    fn status_unsubscribe(&mut self, message: &Message) -> Result<(), MessageError> {
        let component = Self::component_id(message)?;
        let refs = message.status_refs()?;
        self.subscriptions.unsubscribe(component, &refs);
        Ok(())
    }

    fn command_request(&self, message: &Message, outbox: &mut Outbox) -> Result<(), MessageError> {
        let component = Self::component_id(message)?;
        let args = message.command_args()?;
        let returns = lock(&self.registry).handle_command(component, &args)?;
        info!(component, count = args.len(), "command executed");
        outbox.push(Message::command_response(component, &returns, Utc::now()));
        Ok(())
    }

    fn alarm(&self, kind: AlarmKind, message: &Message, outbox: &mut Outbox) -> Result<(), MessageError> {
        let component = Self::component_id(message)?;
        let code = message
            .alarm_code()
            .ok_or_else(|| MessageError::Invalid("missing attribute 'aCId'".to_owned()))?;
        let mut registry = lock(&self.registry);
        let alarm = registry.get_mut(component)?.alarm_mut(code)?;
        let now = Utc::now();
        let reply = match kind {
            AlarmKind::Acknowledge => {
                alarm.acknowledge(now);
                AlarmKind::Acknowledged
            }
            AlarmKind::Suspend => {
                alarm.suspend(now);
                AlarmKind::Suspended
            }
            AlarmKind::Resume => {
                alarm.resume(now);
                AlarmKind::Resumed
            }
            AlarmKind::Request => AlarmKind::Issue,
            _ => {
                return Err(MessageError::Unsupported(format!(
                    "Alarm {}",
                    kind.specialization()
                )));
            }
        };
        outbox.push(alarm.to_message(reply));
        Ok(())
    }
}

impl RoleHandler for SiteHandler {
    fn role(&self) -> Role {
        Role::Site
    }

    fn version_message(&self, settings: &ProxySettings, _resolved: Option<&str>) -> Message {
        Message::version(
            &[settings.site_id.clone()],
            &settings.core_versions,
            &settings.sxl.version,
        )
    }

    /// The supervisor must answer for this site.
    fn accept_version(&mut self, message: &Message, settings: &ProxySettings) -> Result<(), ProxyError> {
        let site_ids = message.site_ids()?;
        if !site_ids.is_empty() && !site_ids.contains(&settings.site_id) {
            return Err(ProxyError::Handshake(format!(
                "supervisor answered for site ids [{}], expected {}",
                site_ids.join(", "),
                settings.site_id
            )));
        }
        Ok(())
    }

    fn handle_message(&mut self, message: &Message, outbox: &mut Outbox) -> Result<(), MessageFault> {
        match message.message_type() {
            MessageType::AggregatedStatusRequest => self.aggregated_status_request(message, outbox)?,
            MessageType::StatusRequest => self.status_request(message, outbox)?,
            MessageType::StatusSubscribe => self.status_subscribe(message)?,
            MessageType::StatusUnsubscribe => self.status_unsubscribe(message)?,
            MessageType::CommandRequest => self.command_request(message, outbox)?,
            MessageType::Alarm(kind) => self.alarm(kind, message, outbox)?,
            other => return Err(MessageError::Unsupported(other.as_str().to_owned()).into()),
        }
        Ok(())
    }

    fn on_ready(&mut self, outbox: &mut Outbox) {
        let registry = lock(&self.registry);
        let now = Utc::now();
        for component in registry.components() {
            outbox.push(component.aggregated_status_message(now));
        }
    }

    fn on_tick(&mut self, now: Instant, outbox: &mut Outbox) {
        if self.subscriptions.is_empty() {
            return;
        }
        let registry = lock(&self.registry);
        for update in self.subscriptions.updates(now, &registry) {
            outbox.push(update);
        }
    }
}
