//! Ownership of the single active outbound channel.
//!
//! ## Call policy
//!
//! [`ConnectionSupervisor::send`] runs one call against the active handle
//! under a deadline that covers readiness, the call itself, and any
//! reconnect. On a transport-unavailable failure it performs exactly one
//! lazy reconnect and retries exactly once on the new handle. Every other
//! failure, and any failure of the retry, is returned to the caller.
//!
//! The request is cloned for the retry, so it must be cheap to clone or the
//! caller should accept the copy.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::Instrument;

use crate::config::ChannelConfig;
use crate::connector::{Connector, GrpcConnector};
use crate::endpoint::Target;
use crate::error::ConnectivityError;

fn duration_to_u64_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Clone)]
struct ActiveHandle<H> {
    generation: u64,
    handle: H,
}

/// Absolute deadline of one `send`, plus the budget it was derived from.
#[derive(Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    fn exceeded(self) -> ConnectivityError {
        ConnectivityError::DeadlineExceeded(self.budget)
    }
}

/// Supervises the outbound channel: startup connect, per-call deadline,
/// one lazy reconnect, shutdown.
pub struct ConnectionSupervisor<C: Connector> {
    connector: C,
    active: RwLock<Option<ActiveHandle<C::Handle>>>,
    generations: AtomicU64,
    // Serialises dialling so concurrent failures produce a single reconnect.
    dial_gate: tokio::sync::Mutex<()>,
    closed: CancellationToken,
    startup_retry_interval: Duration,
    call_timeout: Duration,
}

impl ConnectionSupervisor<GrpcConnector> {
    /// Supervisor over a tonic channel to `endpoint`.
    ///
    /// Nothing is dialled until [`establish`](Self::establish),
    /// [`establish_with_retry`](Self::establish_with_retry) or the first
    /// [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::InvalidEndpoint`] if `endpoint` cannot be
    /// parsed or configured.
    pub fn grpc(endpoint: &str, config: ChannelConfig) -> Result<Self, ConnectivityError> {
        let target = Target::parse(endpoint)?;
        tracing::info!(
            endpoint = %target,
            security = %target.security(),
            "configuring observer channel"
        );
        let connector = GrpcConnector::new(target, config.clone())?;
        Ok(Self::new(connector, &config))
    }
}

impl<C: Connector> ConnectionSupervisor<C> {
    #[must_use]
    pub fn new(connector: C, config: &ChannelConfig) -> Self {
        Self {
            connector,
            active: RwLock::new(None),
            generations: AtomicU64::new(0),
            dial_gate: tokio::sync::Mutex::new(()),
            closed: CancellationToken::new(),
            startup_retry_interval: config.startup_retry_interval,
            call_timeout: config.call_timeout,
        }
    }

    #[must_use]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Default per-call deadline.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Generation of the active handle, if one is installed.
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        self.active.read().as_ref().map(|a| a.generation)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Dial once and install the result as the active handle.
    ///
    /// # Errors
    ///
    /// Returns the connector's error, or [`ConnectivityError::Closed`] after
    /// shutdown.
    pub async fn establish(&self) -> Result<u64, ConnectivityError> {
        let _gate = self.dial_gate.lock().await;
        let handle = self.connector.connect().await?;
        self.install(handle).map(|a| a.generation)
    }

    /// Establish, retrying on a fixed interval until success or cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::Closed`] if `cancel` fires or the
    /// supervisor is shut down, and [`ConnectivityError::InvalidEndpoint`]
    /// immediately since retrying cannot fix it.
    pub async fn establish_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> Result<u64, ConnectivityError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(ConnectivityError::Closed),
                outcome = self.establish() => outcome,
            };
            match outcome {
                Ok(generation) => {
                    if attempt > 1 {
                        tracing::info!(attempt, generation, "observer channel established after retries");
                    }
                    return Ok(generation);
                }
                Err(e @ (ConnectivityError::InvalidEndpoint { .. } | ConnectivityError::Closed)) => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        retry_in_ms = duration_to_u64_ms(self.startup_retry_interval),
                        "initial connect to observer failed, retrying"
                    );
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(ConnectivityError::Closed),
                () = self.closed.cancelled() => return Err(ConnectivityError::Closed),
                () = tokio::time::sleep(self.startup_retry_interval) => {}
            }
        }
    }

    /// Run `call` against the active handle with wait-for-ready and a deadline.
    ///
    /// `call` receives a clone of the handle and of `req`; it is invoked at
    /// most twice.
    ///
    /// # Errors
    ///
    /// - [`ConnectivityError::DeadlineExceeded`] when `timeout` elapses.
    /// - [`ConnectivityError::Rpc`] with the remote status otherwise.
    /// - [`ConnectivityError::Connect`] when the reconnect itself fails.
    /// - [`ConnectivityError::Closed`] after shutdown.
    pub async fn send<F, Fut, Req, Res>(
        &self,
        req: Req,
        timeout: Duration,
        call: F,
        op_name: &'static str,
    ) -> Result<Res, ConnectivityError>
    where
        F: Fn(C::Handle, Req) -> Fut,
        Fut: Future<Output = Result<Res, Status>>,
        Req: Clone,
    {
        if self.is_closed() {
            return Err(ConnectivityError::Closed);
        }
        let deadline = Deadline::after(timeout);

        // Without a handle the call dials first; that dial is its one reconnect.
        let current = self.current();
        let dialled_up_front = current.is_none();
        let active = match current {
            Some(active) => active,
            None => self.reconnect(None, deadline).await?,
        };

        let err = match self
            .attempt(&active, req.clone(), deadline, &call, op_name, 1)
            .await
        {
            Ok(res) => return Ok(res),
            Err(e) => e,
        };

        if dialled_up_front || !err.is_unavailable() {
            tracing::warn!(op = op_name, generation = active.generation, error = %err, "gRPC call failed");
            return Err(err);
        }

        tracing::warn!(
            op = op_name,
            generation = active.generation,
            error = %err,
            "observer unavailable, trying lazy reconnect"
        );
        let failed_generation = active.generation;
        drop(active);

        let fresh = match self.reconnect(Some(failed_generation), deadline).await {
            Ok(fresh) => fresh,
            Err(e) => {
                tracing::error!(op = op_name, error = %e, "lazy reconnect failed");
                return Err(e);
            }
        };

        let result = self
            .attempt(&fresh, req, deadline, &call, op_name, 2)
            .await;
        match &result {
            Ok(_) => tracing::info!(op = op_name, generation = fresh.generation, "gRPC call succeeded after reconnect"),
            Err(e) => tracing::error!(op = op_name, generation = fresh.generation, error = %e, "gRPC call giving up"),
        }
        result
    }

    /// Close the active handle and refuse further calls. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let previous = self.active.write().take();
        if let Some(previous) = previous {
            tracing::info!(generation = previous.generation, "observer channel closed");
        }
    }

    fn current(&self) -> Option<ActiveHandle<C::Handle>> {
        self.active.read().clone()
    }

    /// Dial a replacement for `failed`, or reuse a handle another caller
    /// installed in the meantime.
    async fn reconnect(
        &self,
        failed: Option<u64>,
        deadline: Deadline,
    ) -> Result<ActiveHandle<C::Handle>, ConnectivityError> {
        let dial = async {
            let _gate = self.dial_gate.lock().await;
            if let Some(current) = self.current()
                && Some(current.generation) != failed
            {
                tracing::debug!(generation = current.generation, "reusing newer observer channel");
                return Ok(current);
            }
            let handle = self.connector.connect().await?;
            self.install(handle)
        };
        timeout_at(deadline.at, dial)
            .await
            .map_err(|_| deadline.exceeded())?
    }

    /// Swap `handle` in as active; the previous handle is dropped (closed).
    fn install(&self, handle: C::Handle) -> Result<ActiveHandle<C::Handle>, ConnectivityError> {
        let (fresh, previous) = {
            let mut slot = self.active.write();
            if self.closed.is_cancelled() {
                return Err(ConnectivityError::Closed);
            }
            let fresh = ActiveHandle {
                generation: self.generations.fetch_add(1, Ordering::SeqCst) + 1,
                handle,
            };
            let previous = slot.replace(fresh.clone());
            (fresh, previous)
        };
        tracing::info!(
            endpoint = %self.connector.endpoint(),
            generation = fresh.generation,
            replaced = previous.as_ref().map(|p| p.generation),
            "observer channel ready"
        );
        drop(previous);
        Ok(fresh)
    }

    async fn attempt<F, Fut, Req, Res>(
        &self,
        active: &ActiveHandle<C::Handle>,
        req: Req,
        deadline: Deadline,
        call: &F,
        op_name: &'static str,
        attempt: u32,
    ) -> Result<Res, ConnectivityError>
    where
        F: Fn(C::Handle, Req) -> Fut,
        Fut: Future<Output = Result<Res, Status>>,
    {
        let span = tracing::debug_span!(
            "grpc_call",
            op = op_name,
            attempt,
            generation = active.generation
        );
        let mut handle = active.handle.clone();
        let connector = &self.connector;

        let fut = async move {
            connector.ready(&mut handle).await?;
            call(handle, req).await.map_err(ConnectivityError::Rpc)
        };

        match timeout_at(deadline.at, fut).instrument(span).await {
            Ok(result) => result,
            Err(_) => Err(deadline.exceeded()),
        }
    }
}
