// rsmp-proxy: the per-connection RSMP state machine and everything that hangs
// off it (role handlers, collectors/matchers, the component model).

pub mod aggregated_status;
pub mod alarm;
pub mod collector;
pub mod component;
mod connection;
pub mod error;
mod listener;
pub mod matcher;
pub mod proxy;
pub mod role;
pub mod settings;
pub mod state;

pub use aggregated_status::{AggregatedFlag, AggregatedStatus};
pub use alarm::AlarmState;
pub use collector::{
    CollectError, CollectOptions, CollectResult, CollectStatus, Collector, DirectionFilter,
    Verdict,
};
pub use component::{CommandHandler, Component, ComponentKind, ComponentRegistry, StatusValue};
pub use error::{MessageError, ProxyError};
pub use listener::CancelHandle;
pub use matcher::{Condition, MatchResult, Matcher, Query};
pub use proxy::{ConnectionInfo, Proxy, SendOutcome};
pub use role::{MessageFault, Outbox, Role, RoleHandler};
pub use settings::{Intervals, ProxySettings, Sxl, Timeouts};
pub use state::ProxyState;
