#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
//! Supervised outbound gRPC channel.
//!
//! [`ConnectionSupervisor`] owns exactly one active channel to the remote
//! observer. It retries the initial connect until it succeeds, bounds every
//! call by a deadline, and on a transport-unavailable failure dials once more
//! and retries the call once.

pub mod backoff;
pub mod config;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod supervisor;

pub use config::{BackoffConfig, ChannelConfig};
pub use connector::{Connector, GrpcConnector};
pub use endpoint::{Target, TransportSecurity, build_endpoint};
pub use error::ConnectivityError;
pub use supervisor::ConnectionSupervisor;
