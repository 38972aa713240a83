// Typed views of the list payloads carried inside RSMP messages.
//
// Field names follow the wire abbreviations; the Rust names spell them out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status/command value quality (`q` on status items).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Quality {
    #[default]
    Recent,
    Old,
    Undefined,
    Unknown,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Recent => "recent",
            Quality::Old => "old",
            Quality::Undefined => "undefined",
            Quality::Unknown => "unknown",
        }
    }
}

/// One entry of the `RSMP` list in a Version message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    #[serde(rename = "vers")]
    pub version: String,
}

/// One entry of the `siteId` list in a Version message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteIdEntry {
    #[serde(rename = "sId")]
    pub site_id: String,
}

/// A status reference, as carried by StatusRequest and StatusUnsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusRef {
    #[serde(rename = "sCI")]
    pub code: String,
    #[serde(rename = "n")]
    pub name: String,
}

impl StatusRef {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        StatusRef {
            code: code.into(),
            name: name.into(),
        }
    }
}

/// A status value, as carried by StatusResponse and StatusUpdate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusItem {
    #[serde(rename = "sCI")]
    pub code: String,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "s")]
    pub value: Value,
    #[serde(rename = "q", default)]
    pub quality: Quality,
}

/// A StatusSubscribe entry.
///
/// `uRt` is the update interval in seconds as a string; `"0"` means "only on
/// change". `sOc` (send on change) only exists from RSMP 3.1.5 on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeItem {
    #[serde(rename = "sCI")]
    pub code: String,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "uRt")]
    pub update_rate: String,
    #[serde(rename = "sOc", default, skip_serializing_if = "Option::is_none")]
    pub send_on_change: Option<bool>,
}

/// A CommandRequest argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandArg {
    #[serde(rename = "cCI")]
    pub code: String,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "cO")]
    pub operation: String,
    #[serde(rename = "v")]
    pub value: Value,
}

/// A CommandResponse return value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReturn {
    #[serde(rename = "cCI")]
    pub code: String,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "v")]
    pub value: Value,
    /// `recent`, `undefined` or `unknown`.
    pub age: String,
}

/// Extra value reported with an alarm (`rvs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmReturnValue {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "v")]
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_item_uses_wire_abbreviations() {
        let item = StatusItem {
            code: "S0001".to_owned(),
            name: "signalgroupstatus".to_owned(),
            value: json!("A1"),
            quality: Quality::Recent,
        };
        assert_eq!(
            serde_json::to_value(&item).unwrap(),
            json!({"sCI": "S0001", "n": "signalgroupstatus", "s": "A1", "q": "recent"})
        );
    }

    #[test]
    fn missing_quality_defaults_to_recent() {
        let item: StatusItem =
            serde_json::from_value(json!({"sCI": "S0001", "n": "x", "s": null})).unwrap();
        assert_eq!(item.quality, Quality::Recent);
        assert_eq!(item.value, Value::Null);
    }

    #[test]
    fn subscribe_item_omits_absent_send_on_change() {
        let item = SubscribeItem {
            code: "S0014".to_owned(),
            name: "status".to_owned(),
            update_rate: "5".to_owned(),
            send_on_change: None,
        };
        assert_eq!(
            serde_json::to_value(&item).unwrap(),
            json!({"sCI": "S0014", "n": "status", "uRt": "5"})
        );
    }
}
