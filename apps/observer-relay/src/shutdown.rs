//! Termination signals mapped onto a [`CancellationToken`].

use std::fmt;

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Signal that ended the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    #[cfg(unix)]
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            #[cfg(unix)]
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
///
/// # Errors
/// Returns an error if a signal handler cannot be installed.
pub async fn wait_for_signal() -> Result<ShutdownSignal> {
    let received = tokio::select! {
        result = wait_interrupt() => result?,
        result = wait_terminate() => result?,
    };
    tracing::info!(signal = %received, "shutdown signal received");
    Ok(received)
}

/// Cancel `token` on the first termination signal.
///
/// A handler installation failure also cancels.
#[must_use = "dropping the handle detaches the watcher"]
pub fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = wait_for_signal() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "signal handling failed, shutting down");
                }
                token.cancel();
            }
            () = token.cancelled() => {}
        }
    })
}

async fn wait_interrupt() -> Result<ShutdownSignal> {
    signal::ctrl_c().await.map_err(|e| {
        tracing::error!(%e, "failed to listen for SIGINT");
        e
    })?;
    Ok(ShutdownSignal::Interrupt)
}

#[cfg(unix)]
async fn wait_terminate() -> Result<ShutdownSignal> {
    let mut handler = signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
        tracing::error!(%e, "failed to install SIGTERM handler");
        e
    })?;
    handler.recv().await;
    Ok(ShutdownSignal::Terminate)
}

#[cfg(not(unix))]
async fn wait_terminate() -> Result<ShutdownSignal> {
    std::future::pending::<Result<ShutdownSignal>>().await
}
