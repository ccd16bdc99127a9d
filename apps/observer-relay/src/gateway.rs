//! Per-request forwarding: token injection, one supervised call, status
//! pass-through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use observer_sdk::{DataObserverClient, ObservationRequest, ObservationResponse};
use relay_credentials::{CredentialError, CredentialManager};
use relay_transport_grpc::{ConnectionSupervisor, ConnectivityError, GrpcConnector};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tonic::Status;
use tonic::transport::Channel;

/// Deadline of one forwarded call, reconnect included.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

const OBSERVE_DATA_OP: &str = "observer.observe_data";

/// Source of the bearer token attached to forwarded requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token, renewed if needed.
    ///
    /// # Errors
    ///
    /// Returns the credential error when no valid token can be obtained.
    async fn token(&self) -> Result<SecretString, CredentialError>;
}

#[async_trait]
impl TokenProvider for CredentialManager {
    async fn token(&self) -> Result<SecretString, CredentialError> {
        CredentialManager::token(self).await
    }
}

/// Outbound leg of the relay.
#[async_trait]
pub trait ObservationForwarder: Send + Sync {
    /// # Errors
    ///
    /// Returns the connectivity error once the call and its retry are
    /// exhausted or `timeout` elapses.
    async fn forward(
        &self,
        request: ObservationRequest,
        timeout: Duration,
    ) -> Result<ObservationResponse, ConnectivityError>;
}

#[async_trait]
impl ObservationForwarder for ConnectionSupervisor<GrpcConnector> {
    async fn forward(
        &self,
        request: ObservationRequest,
        timeout: Duration,
    ) -> Result<ObservationResponse, ConnectivityError> {
        self.send(
            request,
            timeout,
            |channel: Channel, req: ObservationRequest| async move {
                DataObserverClient::new(channel)
                    .observe_data(req)
                    .await
                    .map(tonic::Response::into_inner)
            },
            OBSERVE_DATA_OP,
        )
        .await
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("could not obtain access token: {0}")]
    Credentials(#[from] CredentialError),

    #[error("forwarding to observer failed: {0}")]
    Connectivity(#[from] ConnectivityError),
}

impl From<GatewayError> for Status {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Credentials(e) => Status::unauthenticated(e.to_string()),
            GatewayError::Connectivity(ConnectivityError::Rpc(status)) => status,
            GatewayError::Connectivity(e @ ConnectivityError::DeadlineExceeded(_)) => {
                Status::deadline_exceeded(e.to_string())
            }
            GatewayError::Connectivity(e @ ConnectivityError::InvalidEndpoint { .. }) => {
                Status::internal(e.to_string())
            }
            GatewayError::Connectivity(e) => Status::unavailable(e.to_string()),
        }
    }
}

/// Handles one inbound observation.
pub struct ForwardingGateway {
    tokens: Arc<dyn TokenProvider>,
    forwarder: Arc<dyn ObservationForwarder>,
    test_mode: bool,
    timeout: Duration,
}

impl ForwardingGateway {
    #[must_use]
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        forwarder: Arc<dyn ObservationForwarder>,
        test_mode: bool,
    ) -> Self {
        Self {
            tokens,
            forwarder,
            test_mode,
            timeout: FORWARD_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    /// Forward `request` with a fresh token.
    ///
    /// In test mode returns `success` without touching either dependency.
    /// A remote `error` status is logged and returned as a normal response.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Credentials`] when no token can be obtained (nothing is
    /// forwarded), [`GatewayError::Connectivity`] when the call fails.
    pub async fn handle(
        &self,
        request: ObservationRequest,
    ) -> Result<ObservationResponse, GatewayError> {
        if self.test_mode {
            tracing::debug!(element_id = request.element_id, "test mode, observation not forwarded");
            return Ok(ObservationResponse::success());
        }

        let token = self.tokens.token().await.inspect_err(|e| {
            tracing::error!(element_id = request.element_id, error = %e, "failed to get access token");
        })?;

        let element_id = request.element_id;
        let forwarded = ObservationRequest {
            token: Some(token.expose_secret().to_owned()),
            ..request
        };

        let response = self
            .forwarder
            .forward(forwarded, self.timeout)
            .await
            .inspect_err(|e| {
                tracing::error!(element_id, error = %e, "failed to forward observation");
            })?;

        if response.is_error() {
            tracing::warn!(
                element_id,
                message = %response.message,
                "observer returned an error status"
            );
        }
        Ok(response)
    }
}
