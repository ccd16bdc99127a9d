#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Observer SDK
//!
//! Contract of the `protos.DataObserver` service shared by the relay's local
//! listener and its outbound client:
//! - Generated protobuf types (`ObservationRequest`, `ObservationResponse`)
//! - Client and server stubs
//! - Status helpers for `ObservationResponse`

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

// === GRPC PROTO STUBS ===
/// Generated protobuf types for `DataObserver`.
#[allow(clippy::pedantic)]
pub mod proto {
    tonic::include_proto!("protos");
}

pub use proto::data_observer_client::DataObserverClient;
pub use proto::data_observer_server::{DataObserver, DataObserverServer};
pub use proto::{ObservationRequest, ObservationResponse};

/// Fully-qualified service name.
pub const SERVICE_NAME: &str = "protos.DataObserver";

/// `status` value of an accepted observation.
pub const STATUS_SUCCESS: &str = "success";

/// `status` value of an observation the remote rejected.
pub const STATUS_ERROR: &str = "error";

impl ObservationResponse {
    /// A `success` response with an empty message.
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: STATUS_SUCCESS.to_owned(),
            message: String::new(),
        }
    }

    /// `true` when the remote reported an application-level error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == STATUS_ERROR
    }
}
