//! Credential-injecting intercepting proxy control plane for launching
//! developer-agent CLI processes in containers without ever placing
//! long-lived credentials inside the container itself.

pub mod aws;
pub mod ca;
pub mod chain;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod policy;
pub mod proxy;
pub mod store;
pub mod telemetry;

pub use config::{AwsConfig, Config, RawConfig};
pub use context::{Registry, RunContext};
pub use error::ProxyError;
pub use proxy::listener::Listener;
pub use proxy::Engine;
