// rsmp: RSMP (Road Side Message Protocol) sites and supervisors.
//
// The protocol engine lives in the member crates; this crate re-exports them
// under one name. The runnable nodes are the `site` and `supervisor` services.

pub use rsmp_log as log;
pub use rsmp_protocol as protocol;
pub use rsmp_proxy as proxy;

pub use rsmp_protocol::{Message, MessageType, ProtocolError};
pub use rsmp_proxy::{Proxy, ProxyError, ProxySettings, ProxyState};
