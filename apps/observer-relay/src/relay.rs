//! Wiring of the relay: credentials, outbound channel, inbound listener.

use std::sync::Arc;

use anyhow::Context;
use relay_credentials::CredentialManager;
use relay_transport_grpc::{ConnectionSupervisor, ConnectivityError, GrpcConnector};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::gateway::ForwardingGateway;
use crate::server::{ObserverRelayService, serve};

/// Bind the configured listen address and run until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or a component fails to
/// start.
pub async fn run(config: RelayConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    serve_relay(config, listener, shutdown).await
}

/// Run the relay on an already bound `listener`.
///
/// Startup logs in (a failure is retried on demand) and connects to the
/// observer, retrying until it succeeds or `shutdown` fires. In test mode
/// neither backend is contacted.
///
/// # Errors
///
/// Returns an error for invalid credential or endpoint configuration, or if
/// the listener fails.
pub async fn serve_relay(
    config: RelayConfig,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let supervisor: Arc<ConnectionSupervisor<GrpcConnector>> = Arc::new(
        ConnectionSupervisor::grpc(&config.observer_endpoint, config.channel)
            .context("invalid observer endpoint")?,
    );

    let credentials = if config.test_mode {
        tracing::warn!("TEST MODE: observations are acknowledged locally and never forwarded");
        Arc::new(CredentialManager::new(&config.credentials)?)
    } else {
        let manager = CredentialManager::start(&config.credentials).await?;
        match supervisor.establish_with_retry(&shutdown).await {
            Ok(generation) => tracing::info!(generation, endpoint = %config.observer_endpoint, "connected to observer"),
            Err(ConnectivityError::Closed) => {
                tracing::info!("shutdown requested before observer connection was established");
                manager.shutdown().await;
                supervisor.shutdown();
                return Ok(());
            }
            Err(e) => {
                manager.shutdown().await;
                return Err(e).context("failed to connect to observer");
            }
        }
        manager
    };

    let gateway = Arc::new(ForwardingGateway::new(
        credentials.clone(),
        supervisor.clone(),
        config.test_mode,
    ));
    let served = serve(
        listener,
        ObserverRelayService::new(gateway),
        config.max_message_size,
        shutdown,
    )
    .await;

    credentials.shutdown().await;
    supervisor.shutdown();
    tracing::info!("relay stopped");
    served
}
