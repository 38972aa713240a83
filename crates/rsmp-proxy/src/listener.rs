use std::sync::Arc;

use rsmp_protocol::Message;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::Instant;
use tracing::warn;

use crate::proxy::Proxy;
use crate::state::ProxyState;

pub(crate) enum Notice {
    Message(Arc<Message>),
    Stopped,
    Timeout,
    Cancelled,
}

/// Cancels a running collector or matcher from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<Notify>);

impl CancelHandle {
    pub fn cancel(&self) {
        // notify_one keeps a permit, so cancelling before the wait starts works.
        self.0.notify_one();
    }
}

/// Subscription to one proxy's message stream. Dropping it detaches it.
pub(crate) struct Listener {
    messages: broadcast::Receiver<Arc<Message>>,
    state: watch::Receiver<ProxyState>,
    cancel: Arc<Notify>,
}

impl Listener {
    pub(crate) fn attach(proxy: &Proxy) -> Self {
        // A fresh watch receiver has the current state marked as seen, so
        // only later transitions wake `next`.
        Listener {
            messages: proxy.subscribe(),
            state: proxy.watch_state(),
            cancel: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Next event. Messages already queued win over stop, cancel and timeout.
    pub(crate) async fn next(&mut self, deadline: Instant) -> Notice {
        loop {
            tokio::select! {
                biased;
                received = self.messages.recv() => match received {
                    Ok(message) => return Notice::Message(message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "listener fell behind, messages skipped");
                    }
                    Err(RecvError::Closed) => return Notice::Stopped,
                },
                changed = self.state.changed() => {
                    if changed.is_err() || *self.state.borrow_and_update() == ProxyState::Stopped {
                        return Notice::Stopped;
                    }
                }
                _ = self.cancel.notified() => return Notice::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return Notice::Timeout,
            }
        }
    }
}
