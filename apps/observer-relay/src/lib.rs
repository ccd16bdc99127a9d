#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Observer relay
//!
//! Accepts `protos.DataObserver/ObserveData` calls on a local listener,
//! attaches a fresh access token and forwards them to the remote observer
//! over a single supervised channel.

pub mod config;
pub mod gateway;
pub mod logging;
pub mod relay;
pub mod server;
pub mod shutdown;

pub use config::{ConfigError, RawConfig, RelayConfig};
pub use gateway::{ForwardingGateway, GatewayError, ObservationForwarder, TokenProvider};
pub use logging::{LogFormat, init_logging};
pub use relay::{run, serve_relay};
