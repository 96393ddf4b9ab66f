//! # Shutdown
//!
//! On a termination signal the process stops taking new requests, lets
//! in-flight ones finish within a grace period, releases the store connection
//! and exits with status 0. The sequence runs at most once per process; any
//! later trigger is logged and ignored.

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use crate::connection::ConnectionManager;

pub type IntakeError = Box<dyn Error + Send + Sync>;

/// Whatever admits inbound work. `stop_accepting` returns once no new work is
/// admitted and in-flight work has drained.
#[rocket::async_trait]
pub trait Intake: Send + Sync {
    async fn stop_accepting(&self) -> Result<(), IntakeError>;
}

pub struct ShutdownCoordinator {
    begun: AtomicBool,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            begun: AtomicBool::new(false),
            grace,
        }
    }

    pub fn has_begun(&self) -> bool {
        self.begun.load(Ordering::SeqCst)
    }

    /// Runs the shutdown sequence and returns the exit code, or `None` when a
    /// sequence was already started by an earlier trigger.
    pub async fn shutdown(&self, intake: &dyn Intake, manager: &ConnectionManager) -> Option<i32> {
        if self.begun.swap(true, Ordering::SeqCst) {
            tracing::info!("shutdown already in progress, ignoring signal");
            return None;
        }

        tracing::info!(grace = ?self.grace, "shutting down, no longer accepting requests");
        match tokio::time::timeout(self.grace, intake.stop_accepting()).await {
            Ok(Ok(())) => tracing::info!("server closed"),
            Ok(Err(err)) => tracing::error!(error = %err, "server did not close cleanly"),
            Err(_) => tracing::warn!(grace = ?self.grace, "server did not close within grace period"),
        }

        manager.disconnect().await;
        tracing::info!("shutdown complete");
        Some(0)
    }
}

/// Resolves on the first SIGINT or SIGTERM and names it.
pub async fn termination_signal() -> &'static str {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
        "SIGINT"
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}

/// Outcome of the launched server task: `None` while it is serving.
pub type Served = Option<Result<(), String>>;

/// The Rocket server as an [`Intake`]: notifies its shutdown handle and waits
/// for the launch task to report that it has stopped.
pub struct RocketIntake {
    handle: rocket::Shutdown,
    served: watch::Receiver<Served>,
}

impl RocketIntake {
    pub fn new(handle: rocket::Shutdown, served: watch::Receiver<Served>) -> Self {
        Self { handle, served }
    }
}

#[rocket::async_trait]
impl Intake for RocketIntake {
    async fn stop_accepting(&self) -> Result<(), IntakeError> {
        self.handle.clone().notify();

        let mut served = self.served.clone();
        let outcome = served
            .wait_for(Option::is_some)
            .await
            .map_err(|_| "server task ended without reporting")?
            .clone();

        match outcome {
            Some(Err(err)) => Err(err.into()),
            _ => Ok(()),
        }
    }
}
