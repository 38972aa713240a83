//! Tracking several item queries against a stream of responses.
//!
//! Each [`Query`] picks out one item (for example status `S0001/signalgroupstatus`)
//! by its identity keys and checks conditions on it. A query is matched while
//! its latest matching item satisfies the conditions; a later item that fails
//! them un-matches it again. The matcher is done when every query is matched
//! at the same time.

use std::fmt;
use std::sync::Arc;

use rsmp_protocol::Message;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::collector::{CollectError, CollectOptions, CollectStatus, Verdict};
use crate::listener::{CancelHandle, Listener, Notice};
use crate::proxy::Proxy;

/// A check on one field of an item.
#[derive(Clone)]
pub enum Condition {
    Equals(Value),
    OneOf(Vec<Value>),
    Predicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
}

impl Condition {
    pub fn predicate(check: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Condition::Predicate(Arc::new(check))
    }

    fn holds(&self, value: &Value) -> bool {
        match self {
            Condition::Equals(expected) => value == expected,
            Condition::OneOf(options) => options.contains(value),
            Condition::Predicate(check) => check(value),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Equals(v) => write!(f, "Equals({})", v),
            Condition::OneOf(v) => write!(f, "OneOf({:?})", v),
            Condition::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Query {
    identity: Vec<(String, Value)>,
    conditions: Vec<(String, Condition)>,
    got: Option<Value>,
    message: Option<Arc<Message>>,
}

impl Query {
    pub fn new() -> Self {
        Query {
            identity: Vec::new(),
            conditions: Vec::new(),
            got: None,
            message: None,
        }
    }

    /// Any value of status `code`/`name`.
    pub fn status(code: &str, name: &str) -> Self {
        Query::new().with_key("sCI", code).with_key("n", name)
    }

    /// Status `code`/`name` whose value (`s`) satisfies `condition`.
    pub fn status_value(code: &str, name: &str, condition: Condition) -> Self {
        Query::status(code, name).with_condition("s", condition)
    }

    /// Return value `code`/`name` of a CommandResponse.
    pub fn command(code: &str, name: &str) -> Self {
        Query::new().with_key("cCI", code).with_key("n", name)
    }

    /// Items whose `key` differs are not about this query.
    pub fn with_key(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.identity.push((key.to_owned(), value.into()));
        self
    }

    pub fn with_condition(mut self, key: &str, condition: Condition) -> Self {
        self.conditions.push((key.to_owned(), condition));
        self
    }

    pub fn is_matched(&self) -> bool {
        self.got.is_some()
    }

    /// The item that currently satisfies the query.
    pub fn got(&self) -> Option<&Value> {
        self.got.as_ref()
    }

    /// The message that carried [`Query::got`].
    pub fn message(&self) -> Option<&Arc<Message>> {
        self.message.as_ref()
    }

    fn evaluate(&self, item: &Map<String, Value>) -> Verdict {
        let concerns_us = self
            .identity
            .iter()
            .all(|(key, expected)| item.get(key) == Some(expected));
        if !concerns_us {
            return Verdict::Indifferent;
        }
        let satisfied = self
            .conditions
            .iter()
            .all(|(key, condition)| item.get(key).is_some_and(|value| condition.holds(value)));
        if satisfied { Verdict::Keep } else { Verdict::Reject }
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub queries: Vec<Query>,
    pub messages: Vec<Arc<Message>>,
    pub status: CollectStatus,
    pub error: Option<CollectError>,
}

impl MatchResult {
    pub fn is_ok(&self) -> bool {
        self.status == CollectStatus::Ok
    }

    pub fn summary(&self) -> Vec<bool> {
        self.queries.iter().map(Query::is_matched).collect()
    }
}

pub struct Matcher {
    listener: Listener,
    options: CollectOptions,
    /// List attribute holding the items; `None` treats each message as one item.
    items_key: Option<String>,
    queries: Vec<Query>,
    messages: Vec<Arc<Message>>,
    progress: watch::Sender<Vec<bool>>,
    status: CollectStatus,
    error: Option<CollectError>,
}

impl Matcher {
    /// `options.num` is ignored; completion is "all queries matched".
    pub fn new(
        proxy: &Proxy,
        options: CollectOptions,
        items_key: Option<&str>,
        queries: Vec<Query>,
    ) -> Self {
        let (progress, _) = watch::channel(vec![false; queries.len()]);
        Matcher {
            listener: Listener::attach(proxy),
            options,
            items_key: items_key.map(str::to_owned),
            queries,
            messages: Vec::new(),
            progress,
            status: CollectStatus::Ready,
            error: None,
        }
    }

    pub fn summary(&self) -> Vec<bool> {
        self.queries.iter().map(Query::is_matched).collect()
    }

    pub fn done(&self) -> bool {
        self.queries.iter().all(Query::is_matched)
    }

    pub fn status(&self) -> CollectStatus {
        self.status
    }

    /// Live view of [`Matcher::summary`] while [`Matcher::collect`] runs.
    pub fn progress(&self) -> watch::Receiver<Vec<bool>> {
        self.progress.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.listener.cancel_handle()
    }

    /// Feed one message. Returns `true` once every query is matched (or the
    /// request was rejected).
    pub fn process(&mut self, message: &Arc<Message>) -> bool {
        if let Some(reason) = self.options.rejection(message) {
            self.status = CollectStatus::Cancelled;
            self.error = Some(CollectError::MessageRejected(reason.to_owned()));
            return true;
        }
        if !self.options.accepts(message) {
            return false;
        }

        let items: Vec<&Map<String, Value>> = match &self.items_key {
            Some(key) => match message.attributes().get(key) {
                Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).collect(),
                _ => Vec::new(),
            },
            None => vec![message.attributes()],
        };

        let mut touched = false;
        for item in items {
            for query in &mut self.queries {
                match query.evaluate(item) {
                    Verdict::Keep => {
                        query.got = Some(Value::Object(item.clone()));
                        query.message = Some(message.clone());
                        touched = true;
                    }
                    Verdict::Reject => {
                        query.got = None;
                        query.message = None;
                        touched = true;
                    }
                    Verdict::Indifferent | Verdict::Cancel => {}
                }
            }
        }
        if touched {
            self.messages.push(message.clone());
            let summary = self.summary();
            self.progress.send_replace(summary);
        }
        if self.done() {
            self.status = CollectStatus::Ok;
            return true;
        }
        false
    }

    pub async fn collect(mut self) -> MatchResult {
        self.status = CollectStatus::Collecting;
        let deadline = Instant::now() + self.options.timeout;
        loop {
            match self.listener.next(deadline).await {
                Notice::Message(message) => {
                    if self.process(&message) {
                        break;
                    }
                }
                Notice::Timeout => {
                    self.status = CollectStatus::Timeout;
                    break;
                }
                Notice::Stopped => {
                    self.status = CollectStatus::Cancelled;
                    self.error = Some(CollectError::Disconnected);
                    break;
                }
                Notice::Cancelled => {
                    self.status = CollectStatus::Cancelled;
                    self.error = Some(CollectError::Cancelled);
                    break;
                }
            }
        }
        MatchResult {
            queries: self.queries,
            messages: self.messages,
            status: self.status,
            error: self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ProxySettings;
    use chrono::Utc;
    use rsmp_protocol::{Quality, StatusItem};
    use serde_json::json;

    fn update(values: &[(&str, &str, &str)]) -> Arc<Message> {
        let items: Vec<StatusItem> = values
            .iter()
            .map(|(code, name, value)| StatusItem {
                code: (*code).to_owned(),
                name: (*name).to_owned(),
                value: json!(value),
                quality: Quality::Recent,
            })
            .collect();
        let raw = Message::status_update("TC", &items, Utc::now()).to_json();
        let value = Message::parse_attributes(raw.as_bytes()).unwrap();
        Arc::new(Message::build(value, raw.as_bytes()).unwrap())
    }

    fn matcher(proxy: &Proxy) -> Matcher {
        Matcher::new(
            proxy,
            CollectOptions::new().types(["StatusUpdate"]),
            Some("sS"),
            vec![
                Query::status_value("S0001", "a", Condition::Equals(json!("1"))),
                Query::status_value("S0002", "b", Condition::Equals(json!("2"))),
                Query::status_value("S0003", "c", Condition::OneOf(vec![json!("3"), json!("33")])),
            ],
        )
    }

    #[test]
    fn queries_can_flip_back_to_unmatched() {
        let proxy = Proxy::new(ProxySettings::new("RN+SI0001"));
        let mut matcher = matcher(&proxy);
        assert_eq!(matcher.summary(), vec![false, false, false]);

        assert!(!matcher.process(&update(&[("S0001", "a", "1"), ("S0002", "b", "2")])));
        assert_eq!(matcher.summary(), vec![true, true, false]);

        assert!(!matcher.process(&update(&[("S0001", "a", "9")])));
        assert_eq!(matcher.summary(), vec![false, true, false]);
        assert!(!matcher.done());

        assert!(!matcher.process(&update(&[("S0003", "c", "33")])));
        assert_eq!(matcher.summary(), vec![false, true, true]);

        assert!(matcher.process(&update(&[("S0001", "a", "1")])));
        assert!(matcher.done());
        assert_eq!(matcher.status(), CollectStatus::Ok);
    }

    #[test]
    fn progress_channel_follows_summary() {
        let proxy = Proxy::new(ProxySettings::new("RN+SI0001"));
        let mut matcher = matcher(&proxy);
        let progress = matcher.progress();
        matcher.process(&update(&[("S0002", "b", "2")]));
        assert_eq!(*progress.borrow(), vec![false, true, false]);
    }

    #[test]
    fn unrelated_items_leave_queries_alone() {
        let proxy = Proxy::new(ProxySettings::new("RN+SI0001"));
        let mut matcher = matcher(&proxy);
        matcher.process(&update(&[("S0001", "a", "1")]));
        matcher.process(&update(&[("S0009", "z", "0")]));
        assert_eq!(matcher.summary(), vec![true, false, false]);
    }

    #[test]
    fn predicate_condition() {
        let query = Query::status_value(
            "S0001",
            "a",
            Condition::predicate(|v| v.as_str().is_some_and(|s| s.starts_with('A'))),
        );
        let mut item = Map::new();
        item.insert("sCI".into(), json!("S0001"));
        item.insert("n".into(), json!("a"));
        item.insert("s".into(), json!("ABC"));
        assert_eq!(query.evaluate(&item), Verdict::Keep);
        item.insert("s".into(), json!("xyz"));
        assert_eq!(query.evaluate(&item), Verdict::Reject);
    }
}
