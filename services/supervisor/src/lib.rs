// supervisor: RSMP supervisor node library.
// Exposes modules for integration testing.

pub mod config;
pub mod handler;
pub mod requests;
pub mod supervisor;

pub use requests::{RemoteSite, RequestError};
pub use supervisor::Supervisor;
