//! Process shutdown signals
//!
//! Handlers are installed when [`ShutdownSignal::register`] is called, so a
//! signal delivered while the client is still connecting is not lost.

use std::io;
use tracing::info;

/// Interrupt/terminate notification
#[cfg(unix)]
pub struct ShutdownSignal {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignal {
    /// Install SIGINT and SIGTERM handlers
    pub fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the first of SIGINT or SIGTERM
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = self.sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
    }
}

#[cfg(not(unix))]
pub struct ShutdownSignal;

#[cfg(not(unix))]
impl ShutdownSignal {
    pub fn register() -> io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down gracefully...");
        }
    }
}
