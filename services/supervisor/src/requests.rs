//! Requests a supervisor sends to one connected site.
//!
//! Every helper attaches its collector (or matcher) before sending, keyed on
//! the request's mId so a MessageNotAck from the site ends the wait early.

use std::sync::Arc;
use std::time::Duration;

use rsmp_protocol::{
    AlarmKind, CommandArg, CommandReturn, Message, MessageType, StatusItem, StatusRef,
    SubscribeItem,
};
use rsmp_proxy::{
    CollectError, CollectOptions, CollectStatus, Collector, ComponentRegistry, MatchResult,
    Matcher, Proxy, ProxyError, Query, SendOutcome, Verdict,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::handler::{SharedRegistry, lock};

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Handle on one site known to the supervisor. Survives reconnects.
#[derive(Clone)]
pub struct RemoteSite {
    site_id: String,
    proxy: Proxy,
    registry: SharedRegistry,
}

impl RemoteSite {
    pub(crate) fn new(site_id: String, proxy: Proxy, registry: SharedRegistry) -> Self {
        RemoteSite {
            site_id,
            proxy,
            registry,
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub(crate) fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Run `f` with the supervisor's view of the site's components.
    pub fn with_components<T>(&self, f: impl FnOnce(&ComponentRegistry) -> T) -> T {
        f(&lock(&self.registry))
    }

    async fn send(&self, message: Message) -> Result<(), ProxyError> {
        match self.proxy.send(message).await? {
            SendOutcome::Sent { .. } => Ok(()),
            SendOutcome::Buffered => Err(ProxyError::NotConnected),
        }
    }

    /// Send `message` and wait until every query is matched by items under
    /// `items_key` of `response_type` messages.
    async fn send_and_match(
        &self,
        message: Message,
        response_type: &str,
        items_key: &str,
        queries: Vec<Query>,
        timeout: Duration,
    ) -> Result<MatchResult, RequestError> {
        let options = options_for(&message, response_type, timeout);
        let matcher = Matcher::new(&self.proxy, options, Some(items_key), queries);
        self.send(message).await?;
        let result = matcher.collect().await;
        finished(result.status, result.error.clone())?;
        Ok(result)
    }

    async fn send_and_collect_one(
        &self,
        message: Message,
        options: CollectOptions,
        verdict: impl FnMut(&Message) -> Verdict + Send + 'static,
    ) -> Result<Arc<Message>, RequestError> {
        let collector = Collector::new(&self.proxy, options).with_predicate(verdict);
        self.send(message).await?;
        let mut messages = collector.collect().await.into_messages()?;
        messages
            .pop()
            .ok_or_else(|| RequestError::InvalidResponse("no message collected".to_owned()))
    }

    // -----------------------------------------------------------------------
    // Statuses
    // -----------------------------------------------------------------------

    pub async fn request_aggregated_status(
        &self,
        component: &str,
        timeout: Duration,
    ) -> Result<Arc<Message>, RequestError> {
        let request = Message::aggregated_status_request(component);
        let options = options_for(&request, "AggregatedStatus", timeout);
        self.send_and_collect_one(request, options, |_| Verdict::Keep)
            .await
    }

    /// Current values of `statuses`, in request order.
    pub async fn request_status(
        &self,
        component: &str,
        statuses: &[StatusRef],
        timeout: Duration,
    ) -> Result<Vec<StatusItem>, RequestError> {
        let queries = statuses
            .iter()
            .map(|s| Query::status(&s.code, &s.name))
            .collect();
        let request = Message::status_request(component, statuses);
        let result = self
            .send_and_match(request, "StatusResponse", "sS", queries, timeout)
            .await?;
        matched_items(&result)
    }

    /// Subscribe to `items`. With `collect_within`, also wait for the first
    /// StatusUpdate covering every item.
    pub async fn subscribe_to_status(
        &self,
        component: &str,
        items: &[SubscribeItem],
        collect_within: Option<Duration>,
    ) -> Result<Option<Vec<StatusItem>>, RequestError> {
        let request = Message::status_subscribe(component, items);
        let Some(timeout) = collect_within else {
            self.send(request).await?;
            debug!(site_id = %self.site_id, component, count = items.len(), "subscribed");
            return Ok(None);
        };
        let queries = items
            .iter()
            .map(|i| Query::status(&i.code, &i.name))
            .collect();
        let result = self
            .send_and_match(request, "StatusUpdate", "sS", queries, timeout)
            .await?;
        matched_items(&result).map(Some)
    }

    pub async fn unsubscribe_to_status(
        &self,
        component: &str,
        statuses: &[StatusRef],
    ) -> Result<(), RequestError> {
        self.send(Message::status_unsubscribe(component, statuses))
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Send a command and wait for a return value per argument.
    pub async fn send_command(
        &self,
        component: &str,
        args: &[CommandArg],
        timeout: Duration,
    ) -> Result<Vec<CommandReturn>, RequestError> {
        let queries = args
            .iter()
            .map(|a| Query::command(&a.code, &a.name))
            .collect();
        let request = Message::command_request(component, args);
        let result = self
            .send_and_match(request, "CommandResponse", "rvs", queries, timeout)
            .await?;
        matched_items(&result)
    }

    // -----------------------------------------------------------------------
    // Alarms
    // -----------------------------------------------------------------------

    pub async fn acknowledge_alarm(
        &self,
        component: &str,
        code: &str,
        timeout: Duration,
    ) -> Result<Arc<Message>, RequestError> {
        self.alarm_request(AlarmKind::Acknowledge, AlarmKind::Acknowledged, component, code, timeout)
            .await
    }

    pub async fn suspend_alarm(
        &self,
        component: &str,
        code: &str,
        timeout: Duration,
    ) -> Result<Arc<Message>, RequestError> {
        self.alarm_request(AlarmKind::Suspend, AlarmKind::Suspended, component, code, timeout)
            .await
    }

    pub async fn resume_alarm(
        &self,
        component: &str,
        code: &str,
        timeout: Duration,
    ) -> Result<Arc<Message>, RequestError> {
        self.alarm_request(AlarmKind::Resume, AlarmKind::Resumed, component, code, timeout)
            .await
    }

    async fn alarm_request(
        &self,
        request: AlarmKind,
        reply: AlarmKind,
        component: &str,
        code: &str,
        timeout: Duration,
    ) -> Result<Arc<Message>, RequestError> {
        let message = Message::alarm(request, component, code, None);
        let options = options_for(&message, "Alarm", timeout);
        let code = code.to_owned();
        self.send_and_collect_one(message, options, move |m| {
            if m.message_type() == MessageType::Alarm(reply) && m.alarm_code() == Some(code.as_str()) {
                Verdict::Keep
            } else {
                Verdict::Indifferent
            }
        })
        .await
    }
}

fn options_for(request: &Message, response_type: &str, timeout: Duration) -> CollectOptions {
    let mut options = CollectOptions::new()
        .types([response_type])
        .timeout(timeout);
    if let Some(component) = request.component_id() {
        options = options.component(component);
    }
    if let Some(m_id) = request.m_id() {
        options = options.m_id(m_id);
    }
    options
}

fn finished(status: CollectStatus, error: Option<CollectError>) -> Result<(), CollectError> {
    match status {
        CollectStatus::Ok => Ok(()),
        CollectStatus::Timeout => Err(CollectError::Timeout),
        _ => Err(error.unwrap_or(CollectError::Cancelled)),
    }
}

fn matched_items<T: DeserializeOwned>(result: &MatchResult) -> Result<Vec<T>, RequestError> {
    result
        .queries
        .iter()
        .map(|query| {
            let item = query
                .got()
                .cloned()
                .ok_or_else(|| RequestError::InvalidResponse("query not matched".to_owned()))?;
            serde_json::from_value(item).map_err(|e| RequestError::InvalidResponse(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_carry_request_id_and_component() {
        let request = Message::aggregated_status_request("TC");
        let options = options_for(&request, "AggregatedStatus", Duration::from_secs(1));
        assert_eq!(options.types, vec!["AggregatedStatus".to_owned()]);
        assert_eq!(options.component.as_deref(), Some("TC"));
        assert_eq!(options.m_id.as_deref(), request.m_id());
    }

    #[test]
    fn unfinished_collections_map_to_errors() {
        assert!(finished(CollectStatus::Ok, None).is_ok());
        assert_eq!(finished(CollectStatus::Timeout, None), Err(CollectError::Timeout));
        assert_eq!(
            finished(
                CollectStatus::Cancelled,
                Some(CollectError::MessageRejected("no".to_owned()))
            ),
            Err(CollectError::MessageRejected("no".to_owned()))
        );
    }
}
