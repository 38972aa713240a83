//! The supervisor node: accepts site connections and keeps one proxy per
//! site id, reused when the site reconnects.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use rsmp_log::Archive;
use rsmp_protocol::{CoreShapeValidator, Message, MessageType, RecordCodec};
use rsmp_proxy::{ComponentRegistry, Proxy, ProxyError, ProxyState};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::handler::SupervisorHandler;
use crate::requests::RemoteSite;

const ARCHIVE_CAPACITY: usize = 10_000;

struct Inner {
    config: SupervisorConfig,
    archive: Arc<Archive>,
    sites: RwLock<HashMap<String, RemoteSite>>,
    /// Bumped whenever a site is added, for `wait_for_site`.
    sites_changed: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (sites_changed, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        Supervisor {
            inner: Arc::new(Inner {
                config,
                archive: Arc::new(Archive::new(ARCHIVE_CAPACITY)),
                sites: RwLock::new(HashMap::new()),
                sites_changed,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.inner.archive
    }

    /// Bind the configured address and start accepting sites. Returns the
    /// bound address.
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.inner.config.bind).await?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "supervisor listening");
        let task = tokio::spawn(self.clone().accept_loop(listener));
        self.track(task);
        Ok(addr)
    }

    pub async fn site(&self, site_id: &str) -> Option<RemoteSite> {
        self.inner.sites.read().await.get(site_id).cloned()
    }

    pub async fn site_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sites.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Wait until `site_id` has connected and completed the handshake.
    pub async fn wait_for_site(&self, site_id: &str, timeout: Duration) -> Result<RemoteSite, ProxyError> {
        let wait = async {
            let mut changes = self.inner.sites_changed.subscribe();
            let site = loop {
                if let Some(site) = self.site(site_id).await {
                    break site;
                }
                if changes.changed().await.is_err() {
                    return Err(ProxyError::Stopped);
                }
            };
            let mut states = site.proxy().watch_state();
            states
                .wait_for(|state| *state == ProxyState::Ready)
                .await
                .map_err(|_| ProxyError::Stopped)?;
            Ok(site)
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or_else(|_| {
            Err(ProxyError::Timeout(format!(
                "site {} not ready within {:?}",
                site_id, timeout
            )))
        })
    }

    /// Stop accepting, close every site connection and wait for the tasks.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        for site in self.inner.sites.read().await.values() {
            site.proxy().stop();
        }
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "supervisor task ended abnormally");
            }
        }
        info!("supervisor stopped");
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        debug!(peer = %peer, "site connected");
                        let task = tokio::spawn(self.clone().serve(stream, peer));
                        self.track(task);
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!("accept loop stopped");
    }

    /// Peek at the site's Version to find its proxy, then run the connection.
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, RecordCodec::new());
        let peek_timeout = self.inner.config.timeouts.acknowledgement;

        let first: BytesMut = match tokio::time::timeout(peek_timeout, reader.next()).await {
            Ok(Some(Ok(record))) => record,
            Ok(Some(Err(e))) => {
                warn!(peer = %peer, error = %e, "read failed before Version");
                return;
            }
            Ok(None) => {
                debug!(peer = %peer, "closed before sending anything");
                return;
            }
            Err(_) => {
                warn!(peer = %peer, timeout = ?peek_timeout, "no Version received");
                return;
            }
        };

        let version = match Message::parse_attributes(&first).and_then(|v| Message::build(v, &first)) {
            Ok(message) if message.message_type() == MessageType::Version => message,
            Ok(message) => {
                warn!(peer = %peer, msg_type = %message.type_name(), "Version must be received first");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "unreadable first record");
                return;
            }
        };
        let site_id = match version.site_ids().ok().and_then(|ids| ids.into_iter().next()) {
            Some(id) => id,
            None => {
                reject(write, &version, "Version carries no site id", peer).await;
                return;
            }
        };

        let Some(site) = self.site_for(&site_id).await else {
            warn!(peer = %peer, site_id = %site_id, "unknown site refused");
            reject(write, &version, &ProxyError::UnknownSite(site_id.clone()).to_string(), peer).await;
            return;
        };

        let handler = SupervisorHandler::new(site_id.clone(), site.registry().clone());
        match site.proxy().run(handler, reader, write, Some(first)).await {
            Ok(()) => info!(site_id = %site_id, "site disconnected"),
            Err(ProxyError::AlreadyConnected) => {
                warn!(site_id = %site_id, peer = %peer, "site already connected, closing new connection");
            }
            Err(e) => warn!(site_id = %site_id, error = %e, "site connection lost"),
        }
    }

    /// The site's handle, created on first contact. `None` when the site is
    /// not allowed to connect.
    async fn site_for(&self, site_id: &str) -> Option<RemoteSite> {
        if let Some(site) = self.site(site_id).await {
            return Some(site);
        }
        let settings = self.inner.config.proxy_settings(site_id)?;
        let mut sites = self.inner.sites.write().await;
        if let Some(site) = sites.get(site_id) {
            return Some(site.clone());
        }
        let proxy = Proxy::with_parts(
            settings,
            Some(self.inner.archive.clone()),
            Arc::new(CoreShapeValidator),
        );
        let site = RemoteSite::new(
            site_id.to_owned(),
            proxy,
            Arc::new(Mutex::new(ComponentRegistry::new())),
        );
        sites.insert(site_id.to_owned(), site.clone());
        drop(sites);
        self.inner.sites_changed.send_modify(|n| *n += 1);
        info!(site_id, "site added");
        Some(site)
    }
}

/// NotAck a Version we will not serve and close the socket.
async fn reject(write: OwnedWriteHalf, version: &Message, reason: &str, peer: SocketAddr) {
    let mut writer = FramedWrite::new(write, RecordCodec::new());
    match Message::not_ack_for(version, reason) {
        Ok(not_ack) => {
            if let Err(e) = writer.send(not_ack.to_json()).await {
                debug!(peer = %peer, error = %e, "could not send rejection");
            }
        }
        Err(e) => debug!(peer = %peer, error = %e, "could not build rejection"),
    }
}
