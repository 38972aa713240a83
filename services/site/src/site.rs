//! The site node: one component registry, one connection per configured
//! supervisor, each kept alive by a reconnect loop.

use std::sync::{Arc, Mutex};

use rsmp_log::Archive;
use rsmp_protocol::{AlarmKind, CoreShapeValidator, Message};
use rsmp_proxy::{
    AggregatedFlag, AlarmState, Component, ComponentRegistry, MessageError, Proxy, ProxyError,
    ProxyState, SendOutcome,
};
use tokio::net::TcpStream;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SiteConfig, SupervisorAddr};
use crate::handler::{SharedRegistry, SiteHandler, lock};

const ARCHIVE_CAPACITY: usize = 10_000;

/// Connection to one supervisor.
#[derive(Clone)]
pub struct SupervisorLink {
    addr: SupervisorAddr,
    proxy: Proxy,
    reconnect: Arc<Notify>,
}

impl SupervisorLink {
    pub fn addr(&self) -> &SupervisorAddr {
        &self.addr
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }
}

pub struct Site {
    config: SiteConfig,
    registry: SharedRegistry,
    archive: Arc<Archive>,
    links: Vec<SupervisorLink>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Site {
    pub fn new(config: SiteConfig) -> Self {
        let registry = Arc::new(Mutex::new(build_registry(&config)));
        let archive = Arc::new(Archive::new(ARCHIVE_CAPACITY));
        let links = config
            .supervisors
            .iter()
            .map(|addr| SupervisorLink {
                addr: addr.clone(),
                proxy: Proxy::with_parts(
                    config.proxy_settings(),
                    Some(archive.clone()),
                    Arc::new(CoreShapeValidator),
                ),
                reconnect: Arc::new(Notify::new()),
            })
            .collect();
        let (shutdown, _) = watch::channel(false);
        Site {
            config,
            registry,
            archive,
            links,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn site_id(&self) -> &str {
        &self.config.site_id
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    pub fn links(&self) -> &[SupervisorLink] {
        &self.links
    }

    /// Proxy of the first configured supervisor.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.links.first().map(|link| &link.proxy)
    }

    /// Run `f` with the component registry locked.
    pub fn with_components<T>(&self, f: impl FnOnce(&mut ComponentRegistry) -> T) -> T {
        f(&mut lock(&self.registry))
    }

    /// Start one connect loop per supervisor. Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }
        info!(site_id = %self.config.site_id, supervisors = self.links.len(), "site starting");
        for link in &self.links {
            tasks.push(tokio::spawn(connect_loop(
                link.clone(),
                self.registry.clone(),
                self.shutdown.subscribe(),
            )));
        }
    }

    /// Skip the remaining reconnect delay of every waiting connection.
    pub fn reconnect_now(&self) {
        for link in &self.links {
            link.reconnect.notify_one();
        }
    }

    /// Stop all connections and wait for their loops to end.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for link in &self.links {
            link.proxy.stop();
        }
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "connect loop ended abnormally");
            }
        }
        info!(site_id = %self.config.site_id, "site stopped");
    }

    // -----------------------------------------------------------------------
    // Application-driven changes
    // -----------------------------------------------------------------------

    /// Set the aggregated status of a component and report it when it changed.
    pub async fn set_aggregated_status(
        &self,
        component: &str,
        flags: &[AggregatedFlag],
    ) -> Result<bool, MessageError> {
        let message = {
            let mut registry = lock(&self.registry);
            let target = registry.get_mut(component)?;
            if !target.aggregated_status.set_flags(flags) {
                return Ok(false);
            }
            target.aggregated_status_message(chrono::Utc::now())
        };
        self.broadcast(message).await;
        Ok(true)
    }

    /// Update a status value. Subscribed supervisors get it on the next tick.
    pub fn set_status(
        &self,
        component: &str,
        code: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<bool, MessageError> {
        lock(&self.registry).set_status(component, code, name, value)
    }

    pub async fn activate_alarm(&self, component: &str, code: &str) -> Result<bool, MessageError> {
        let message = lock(&self.registry)
            .activate_alarm(component, code)?
            .map(|alarm| alarm.to_message(AlarmKind::Issue));
        self.report_alarm(message).await
    }

    pub async fn deactivate_alarm(&self, component: &str, code: &str) -> Result<bool, MessageError> {
        let message = lock(&self.registry)
            .deactivate_alarm(component, code)?
            .map(|alarm| alarm.to_message(AlarmKind::Issue));
        self.report_alarm(message).await
    }

    pub fn alarm(&self, component: &str, code: &str) -> Option<AlarmState> {
        lock(&self.registry)
            .get(component)
            .ok()
            .and_then(|c| c.alarm(code).cloned())
    }

    async fn report_alarm(&self, message: Option<Message>) -> Result<bool, MessageError> {
        match message {
            Some(message) => {
                self.broadcast(message).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn broadcast(&self, message: Message) {
        for link in &self.links {
            match link.proxy.send(message.clone()).await {
                Ok(SendOutcome::Sent { .. }) => {}
                Ok(SendOutcome::Buffered) => {
                    debug!(supervisor = %link.addr.address(), "buffered {}", message.type_name());
                }
                Err(e) => {
                    debug!(supervisor = %link.addr.address(), error = %e, "not sent: {}", message.type_name());
                }
            }
        }
    }
}

fn build_registry(config: &SiteConfig) -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    for component in &config.components {
        registry.add(Component::new(component.id.clone(), component.kind));
    }
    for status in &config.statuses {
        // Config validation guarantees the component exists.
        let _ = registry.set_status(&status.component, &status.code, &status.name, status.value.clone());
    }
    for alarm in &config.alarms {
        if let Ok(component) = registry.get_mut(&alarm.component) {
            *component.find_or_create_alarm(&alarm.code) =
                AlarmState::new(alarm.component.clone(), alarm.code.clone())
                    .with_category(alarm.category.clone(), alarm.priority);
        }
    }
    registry
}

// ---------------------------------------------------------------------------
// Connect loop: connect -> run -> disconnected -> wait -> reconnect
// ---------------------------------------------------------------------------

async fn connect_loop(
    link: SupervisorLink,
    registry: SharedRegistry,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let proxy = &link.proxy;
    let address = link.addr.address();
    let settings = proxy.settings().clone();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        proxy.set_state(ProxyState::Connecting);
        info!(supervisor = %address, "connecting");
        let connected = tokio::time::timeout(settings.timeouts.connect, TcpStream::connect(&address)).await;
        match connected {
            Ok(Ok(stream)) => {
                if *shutdown_rx.borrow() {
                    break;
                }
                let _ = stream.set_nodelay(true);
                match proxy.run_stream(SiteHandler::new(registry.clone()), stream).await {
                    Ok(()) => info!(supervisor = %address, "disconnected"),
                    Err(ProxyError::AlreadyConnected) => {
                        warn!(supervisor = %address, "connection already attached");
                    }
                    Err(e) => warn!(supervisor = %address, error = %e, "connection lost"),
                }
            }
            Ok(Err(e)) => warn!(supervisor = %address, error = %e, "connect failed"),
            Err(_) => warn!(
                supervisor = %address,
                timeout = ?settings.timeouts.connect,
                "connect timed out"
            ),
        }
        if *shutdown_rx.borrow() {
            break;
        }
        proxy.set_state(ProxyState::Disconnected);

        let Some(delay) = settings.intervals.reconnect else {
            proxy.set_state(ProxyState::CannotConnect);
            info!(supervisor = %address, "reconnect disabled, giving up");
            return;
        };
        proxy.set_state(ProxyState::WaitForReconnect);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = link.reconnect.notified() => debug!(supervisor = %address, "reconnecting early"),
            _ = shutdown_rx.changed() => break,
        }
    }
    proxy.set_state(ProxyState::Stopped);
}
