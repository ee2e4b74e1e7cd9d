use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::coordinator::{Coordinator, EngineContext};

/// The rule engine service: owns the coordinator and drives it until a
/// shutdown signal arrives.
pub struct RuleEngineService {
    config: Config,
    coordinator: Arc<Coordinator>,
    cancel: CancellationToken,
}

impl RuleEngineService {
    pub fn new(config: Config, context: EngineContext) -> Result<Self> {
        let coordinator = Arc::new(
            Coordinator::new(config.clone(), context)
                .context("Failed to create coordinator, check the data directory")?,
        );
        Ok(Self {
            config,
            coordinator,
            cancel: CancellationToken::new(),
        })
    }

    /// Token observers can use to request shutdown programmatically.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until ctrl-c or cancellation, then wait for the evaluation loop to
    /// drain within the shutdown timeout.
    pub async fn run(self) -> Result<()> {
        info!("Starting rule engine service");

        let coordinator = self.coordinator.clone();
        let loop_cancel = self.cancel.clone();
        let loop_handle = tokio::spawn(async move { coordinator.run(loop_cancel).await });

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                info!("Received shutdown signal, shutting down gracefully");
            }
            () = self.cancel.cancelled() => {
                info!("Cancellation requested, shutting down");
            }
        }
        self.cancel.cancel();

        match tokio::time::timeout(self.config.shutdown_timeout(), loop_handle).await {
            Ok(Ok(Ok(()))) => info!("Evaluation loop stopped normally"),
            Ok(Ok(Err(e))) => error!(error = ?e, "Evaluation loop stopped with error"),
            Ok(Err(e)) => error!(error = ?e, "Evaluation loop panicked"),
            Err(_) => error!(
                timeout = ?self.config.shutdown_timeout(),
                "Evaluation loop did not stop within the shutdown timeout"
            ),
        }

        info!("Rule engine service shut down");
        Ok(())
    }
}
