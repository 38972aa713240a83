//! Status subscriptions of one supervisor connection.
//!
//! Keyed by `(cId, sCI, n)`. Each subscription is sent on the first tick after
//! it is made, then every `uRt` seconds and, when `sOc` is set, whenever the
//! value changes. The table lives in the connection's handler, so it starts
//! empty on every new connection.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use rsmp_protocol::{Message, StatusItem, StatusRef, SubscribeItem};
use rsmp_proxy::{ComponentRegistry, MessageError, StatusValue};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    component: String,
    code: String,
    name: String,
}

#[derive(Debug)]
struct Subscription {
    /// `None` when `uRt` is 0: only changes are sent.
    interval: Option<Duration>,
    send_on_change: bool,
    last_sent: Option<Instant>,
    last_value: Option<StatusValue>,
}

impl Subscription {
    fn due(&self, now: Instant, current: &StatusValue) -> bool {
        let Some(last_sent) = self.last_sent else {
            return true;
        };
        let periodic = self
            .interval
            .is_some_and(|interval| now.saturating_duration_since(last_sent) >= interval);
        let changed = self.send_on_change && self.last_value.as_ref() != Some(current);
        periodic || changed
    }
}

#[derive(Debug, Default)]
pub struct Subscriptions {
    entries: BTreeMap<Key, Subscription>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, component: &str, code: &str, name: &str) -> bool {
        self.entries.contains_key(&Key {
            component: component.to_owned(),
            code: code.to_owned(),
            name: name.to_owned(),
        })
    }

    /// Add or replace subscriptions. A replaced subscription is sent again on
    /// the next tick.
    pub fn subscribe(&mut self, component: &str, items: &[SubscribeItem]) -> Result<(), MessageError> {
        let mut parsed = Vec::with_capacity(items.len());
        for item in items {
            let invalid = || MessageError::Invalid(format!("invalid uRt '{}'", item.update_rate));
            let rate: f64 = item.update_rate.trim().parse().map_err(|_| invalid())?;
            // Rejects NaN, negative and out-of-range values alike.
            let period = Duration::try_from_secs_f64(rate).map_err(|_| invalid())?;
            let interval = (!period.is_zero()).then_some(period);
            // Without a period the only trigger left is a change.
            let send_on_change = item.send_on_change.unwrap_or(interval.is_none());
            parsed.push((item, interval, send_on_change));
        }
        for (item, interval, send_on_change) in parsed {
            self.entries.insert(
                Key {
                    component: component.to_owned(),
                    code: item.code.clone(),
                    name: item.name.clone(),
                },
                Subscription {
                    interval,
                    send_on_change,
                    last_sent: None,
                    last_value: None,
                },
            );
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, component: &str, items: &[StatusRef]) {
        for item in items {
            self.entries.remove(&Key {
                component: component.to_owned(),
                code: item.code.clone(),
                name: item.name.clone(),
            });
        }
    }

    /// StatusUpdates due at `now`, one per component.
    pub fn updates(&mut self, now: Instant, registry: &ComponentRegistry) -> Vec<Message> {
        let mut due: BTreeMap<String, Vec<StatusItem>> = BTreeMap::new();
        for (key, subscription) in &mut self.entries {
            let Ok(current) = registry.get_status(&key.component, &key.code, &key.name) else {
                continue;
            };
            if !subscription.due(now, &current) {
                continue;
            }
            due.entry(key.component.clone()).or_default().push(StatusItem {
                code: key.code.clone(),
                name: key.name.clone(),
                value: current.value.clone(),
                quality: current.quality,
            });
            subscription.last_sent = Some(now);
            subscription.last_value = Some(current);
        }
        let at = Utc::now();
        due.into_iter()
            .map(|(component, items)| Message::status_update(&component, &items, at))
            .collect()
    }
}
