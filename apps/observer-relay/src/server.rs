//! Local `DataObserver` listener.

use std::sync::Arc;

use observer_sdk::{DataObserver, DataObserverServer, ObservationRequest, ObservationResponse};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::Instrument;

use crate::gateway::ForwardingGateway;

/// gRPC service that hands every call to a [`ForwardingGateway`].
pub struct ObserverRelayService {
    gateway: Arc<ForwardingGateway>,
}

impl ObserverRelayService {
    #[must_use]
    pub fn new(gateway: Arc<ForwardingGateway>) -> Self {
        Self { gateway }
    }
}

#[tonic::async_trait]
impl DataObserver for ObserverRelayService {
    async fn observe_data(
        &self,
        request: Request<ObservationRequest>,
    ) -> Result<Response<ObservationResponse>, Status> {
        let remote = request.remote_addr();
        let request = request.into_inner();
        let span = tracing::info_span!(
            "observe_data",
            element_id = request.element_id,
            indicator = %request.indicator,
            remote = ?remote,
        );

        self.gateway
            .handle(request)
            .instrument(span)
            .await
            .map(Response::new)
            .map_err(Status::from)
    }
}

/// Serve `service` on `listener` until `cancel` fires.
///
/// # Errors
///
/// Returns the transport error if the server stops abnormally.
pub async fn serve(
    listener: TcpListener,
    service: ObserverRelayService,
    max_message_size: usize,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let bound_addr = listener.local_addr()?;
    tracing::info!(%bound_addr, max_message_size, "relay listening");

    let incoming = TcpListenerStream::new(listener);
    Server::builder()
        .add_service(DataObserverServer::new(service).max_decoding_message_size(max_message_size))
        .serve_with_incoming_shutdown(incoming, async move {
            cancel.cancelled().await;
        })
        .await?;

    tracing::info!(%bound_addr, "relay listener stopped");
    Ok(())
}
