pub mod config;
pub mod connections;
pub mod event_bridge;
pub mod handlers;
pub mod monitor;
pub mod server;
pub mod subscriptions;
pub mod tools;

pub use config::ServerConfig;
pub use server::{start, ServerHandle};
pub use subscriptions::{Capability, SubscriptionRegistry};
