//! Supervisor side of a site connection: keeps the supervisor's view of the
//! site's components up to date from what the site reports.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rsmp_protocol::{Message, MessageType};
use rsmp_proxy::{
    AggregatedStatus, ComponentKind, ComponentRegistry, MessageError, MessageFault, Outbox,
    ProxyError, ProxySettings, Role, RoleHandler,
};
use tracing::{debug, info};

pub type SharedRegistry = Arc<Mutex<ComponentRegistry>>;

pub(crate) fn lock(registry: &SharedRegistry) -> MutexGuard<'_, ComponentRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SupervisorHandler {
    site_id: String,
    registry: SharedRegistry,
}

impl SupervisorHandler {
    pub fn new(site_id: impl Into<String>, registry: SharedRegistry) -> Self {
        SupervisorHandler {
            site_id: site_id.into(),
            registry,
        }
    }

    fn component_id(message: &Message) -> Result<&str, MessageError> {
        message
            .component_id()
            .ok_or_else(|| MessageError::Invalid("missing attribute 'cId'".to_owned()))
    }

    fn aggregated_status(&self, message: &Message) -> Result<(), MessageError> {
        let id = Self::component_id(message)?;
        let bits = AggregatedStatus::parse_se(message.attribute("se")?)?;
        let mut registry = lock(&self.registry);
        let (component, created) = registry.find_or_create(id, ComponentKind::Other);
        if created {
            info!(site_id = %self.site_id, component = id, "created stub component");
        }
        if component.aggregated_status.set_bits(bits) {
            debug!(
                site_id = %self.site_id,
                component = id,
                flags = ?component.aggregated_status.flags(),
                "aggregated status changed"
            );
        }
        Ok(())
    }

    fn alarm(&self, message: &Message) -> Result<(), MessageError> {
        let id = Self::component_id(message)?;
        let code = message
            .alarm_code()
            .ok_or_else(|| MessageError::Invalid("missing attribute 'aCId'".to_owned()))?;
        let mut registry = lock(&self.registry);
        let (component, _) = registry.find_or_create(id, ComponentKind::Other);
        let alarm = component.find_or_create_alarm(code);
        if alarm.apply(message)? {
            info!(
                site_id = %self.site_id,
                component = id,
                alarm = code,
                active = alarm.is_active(),
                acknowledged = alarm.is_acknowledged(),
                suspended = alarm.is_suspended(),
                "alarm {}",
                message.type_name()
            );
        }
        Ok(())
    }

    /// Remember reported status values on the component.
    fn statuses(&self, message: &Message) -> Result<(), MessageError> {
        let id = Self::component_id(message)?;
        let items = message.status_items()?;
        let mut registry = lock(&self.registry);
        let (component, _) = registry.find_or_create(id, ComponentKind::Other);
        for item in items {
            component.set_status(&item.code, &item.name, item.value, item.quality);
        }
        Ok(())
    }
}

impl RoleHandler for SupervisorHandler {
    fn role(&self) -> Role {
        Role::Supervisor
    }

    fn version_message(&self, settings: &ProxySettings, resolved: Option<&str>) -> Message {
        let versions = match resolved {
            Some(version) => vec![version.to_owned()],
            None => settings.core_versions.clone(),
        };
        Message::version(&[settings.site_id.clone()], &versions, &settings.sxl.version)
    }

    fn accept_version(&mut self, message: &Message, settings: &ProxySettings) -> Result<(), ProxyError> {
        let site_ids = message.site_ids()?;
        if !site_ids.contains(&settings.site_id) {
            return Err(ProxyError::UnknownSite(site_ids.join(", ")));
        }
        Ok(())
    }

    fn handle_message(&mut self, message: &Message, _outbox: &mut Outbox) -> Result<(), MessageFault> {
        match message.message_type() {
            MessageType::AggregatedStatus => self.aggregated_status(message)?,
            MessageType::Alarm(kind) if kind.carries_state() => self.alarm(message)?,
            MessageType::StatusResponse | MessageType::StatusUpdate => self.statuses(message)?,
            MessageType::CommandResponse => {}
            MessageType::Alarm(kind) => {
                return Err(MessageError::Unsupported(format!("Alarm {}", kind.specialization())).into());
            }
            other => return Err(MessageError::Unsupported(other.as_str().to_owned()).into()),
        }
        Ok(())
    }
}
