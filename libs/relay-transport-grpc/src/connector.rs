//! Dialling seam for [`ConnectionSupervisor`](crate::ConnectionSupervisor).

use async_trait::async_trait;
use http::Request;
use tokio::time::Instant;
use tonic::body::Body;
use tonic::transport::{Channel, Endpoint};
use tower::ServiceExt;
use tracing::Instrument;

use crate::backoff::Backoff;
use crate::config::ChannelConfig;
use crate::endpoint::{Target, build_endpoint};
use crate::error::ConnectivityError;

fn duration_to_u64_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Opens outbound channels.
///
/// One `connect` call is one establish: implementations may retry
/// internally within their own budget but must eventually return.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Cheap-to-clone handle to an open channel.
    type Handle: Clone + Send + Sync + 'static;

    /// Human-readable endpoint for logs and errors.
    fn endpoint(&self) -> String;

    /// Open a new channel.
    async fn connect(&self) -> Result<Self::Handle, ConnectivityError>;

    /// Wait until `handle` can accept a call.
    async fn ready(&self, _handle: &mut Self::Handle) -> Result<(), ConnectivityError> {
        Ok(())
    }
}

/// [`Connector`] producing tonic [`Channel`]s.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    target: Target,
    endpoint: Endpoint,
    config: ChannelConfig,
}

impl GrpcConnector {
    /// # Errors
    ///
    /// Returns [`ConnectivityError::InvalidEndpoint`] if the target cannot be
    /// configured.
    pub fn new(target: Target, config: ChannelConfig) -> Result<Self, ConnectivityError> {
        let endpoint = build_endpoint(&target, &config)?;
        Ok(Self {
            target,
            endpoint,
            config,
        })
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    type Handle = Channel;

    fn endpoint(&self) -> String {
        self.target.to_string()
    }

    async fn connect(&self) -> Result<Channel, ConnectivityError> {
        let span = tracing::debug_span!(
            "grpc_connect",
            service = self.config.service_name,
            endpoint = %self.target,
            security = %self.target.security(),
        );

        async {
            let budget_end = Instant::now() + self.config.establish_budget;
            let mut backoff = Backoff::new(&self.config.backoff);
            let mut attempt: u32 = 0;

            loop {
                attempt += 1;
                match self.endpoint.connect().await {
                    Ok(channel) => {
                        tracing::info!(
                            service = self.config.service_name,
                            attempt,
                            "gRPC channel connected"
                        );
                        return Ok(channel);
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        if Instant::now() + delay >= budget_end {
                            tracing::warn!(
                                service = self.config.service_name,
                                attempt,
                                error = %e,
                                "gRPC connect budget exhausted"
                            );
                            return Err(ConnectivityError::Connect {
                                endpoint: self.target.to_string(),
                                attempts: attempt,
                                reason: describe_transport_error(&e),
                            });
                        }
                        tracing::debug!(
                            attempt,
                            error = %e,
                            backoff_ms = duration_to_u64_ms(delay),
                            "gRPC connect failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn ready(&self, handle: &mut Channel) -> Result<(), ConnectivityError> {
        ServiceExt::<Request<Body>>::ready(handle)
            .await
            .map(drop)
            .map_err(|e| ConnectivityError::Connect {
                endpoint: self.target.to_string(),
                attempts: 1,
                reason: describe_transport_error(&e),
            })
    }
}

/// Flatten a transport error and its sources into one line.
fn describe_transport_error(e: &(dyn std::error::Error + 'static)) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
