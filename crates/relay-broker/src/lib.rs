mod auth;
mod broker;
pub mod console;
mod index;
pub mod logging;
mod manager;
mod session;

pub use auth::{AllowAll, Authenticator};
pub use broker::{BrokerConfig, BrokerError, BrokerHandle, spawn};
