// site: RSMP site node library.
// Exposes modules for integration testing.

pub mod config;
pub mod handler;
pub mod site;
pub mod subscriptions;

pub use site::{Site, SupervisorLink};
