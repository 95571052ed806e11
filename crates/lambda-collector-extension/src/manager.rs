//! Lifecycle manager.
//!
//! Drives the extension from registration to exit:
//! 1. Registers with the Extensions API
//! 2. Starts the collector subprocess
//! 3. Polls for lifecycle events until SHUTDOWN, a poll failure,
//!    cancellation or a collector crash
//! 4. Stops the collector with a grace period derived from the SHUTDOWN
//!    deadline
//!
//! The collector is always stopped once it has been started, whatever ended
//! the loop. `stop` is called exactly once, after the last poll.

use crate::client::{ExtensionId, ExtensionsApi};
use crate::config::{Config, ShutdownConfig};
use crate::error::{ExtensionError, Result};
use crate::event::{LifecycleEvent, ShutdownReason, remaining_budget};
use crate::supervisor::{CollectorCommand, ExitInfo, Supervisor};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Inclusive bounds for the collector's shutdown grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraceBounds {
    /// Shortest grace period ever given.
    pub min: Duration,
    /// Longest grace period ever given.
    pub max: Duration,
}

impl GraceBounds {
    /// Creates bounds from a minimum and maximum.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Clamps a host-reported budget into these bounds.
    ///
    /// If `min` exceeds `max` the maximum wins.
    pub fn clamp(&self, budget: Duration) -> Duration {
        budget.max(self.min).min(self.max)
    }
}

impl Default for GraceBounds {
    fn default() -> Self {
        Self::from(&ShutdownConfig::default())
    }
}

impl From<&ShutdownConfig> for GraceBounds {
    fn from(config: &ShutdownConfig) -> Self {
        Self::new(config.min_grace, config.max_grace)
    }
}

/// Settings the lifecycle manager runs with.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name to register with the Extensions API.
    pub extension_name: String,
    /// Version string reported in logs.
    pub version: String,
    /// Shutdown grace period bounds.
    pub grace: GraceBounds,
}

impl ManagerConfig {
    /// Derives manager settings from the loaded configuration.
    pub fn from_config(config: &Config, version: impl Into<String>) -> Self {
        Self {
            extension_name: config.extension_name(),
            version: version.into(),
            grace: GraceBounds::from(&config.shutdown),
        }
    }
}

/// Why the event loop stopped.
#[derive(Debug)]
enum LoopExit {
    Shutdown {
        reason: ShutdownReason,
        budget: Duration,
    },
    Cancelled,
    PollFailed(ExtensionError),
    Crashed(ExitInfo),
}

/// Orchestrates registration, collector supervision and shutdown.
pub struct LifecycleManager<A, S> {
    config: ManagerConfig,
    api: A,
    supervisor: S,
    command: CollectorCommand,
    cancel_token: CancellationToken,
}

impl<A, S> LifecycleManager<A, S>
where
    A: ExtensionsApi,
    S: Supervisor,
{
    /// Creates a manager that will launch `command` under `supervisor`.
    pub fn new(config: ManagerConfig, api: A, supervisor: S, command: CollectorCommand) -> Self {
        Self {
            config,
            api,
            supervisor,
            command,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Replaces the cancellation token, for callers that already own one.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Returns a handle to the cancellation token.
    ///
    /// Cancelling it is treated the same as a SHUTDOWN event.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Runs the extension until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the lifecycle: registration or start
    /// failures unchanged, a poll failure, or
    /// [`ExtensionError::ProcessCrashed`] if the collector died. Errors hit
    /// while stopping the collector are logged, not returned. A SHUTDOWN
    /// event or cancellation yields `Ok(())`. Cancellation before the
    /// collector is started returns without starting it.
    pub async fn run(self) -> Result<()> {
        let span = tracing::info_span!(
            "lifecycle",
            extension = %self.config.extension_name,
            version = %self.config.version,
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<()> {
        tracing::info!("Launching collector extension");

        let registered = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => {
                tracing::info!("Cancelled during registration, collector not started");
                return Ok(());
            }
            registered = self.api.register(&self.config.extension_name) => registered,
        };

        let registration = match registered {
            Ok(registration) => registration,
            Err(e) => {
                tracing::error!(error = %e, "Extension registration failed");
                return Err(e);
            }
        };

        tracing::info!(
            extension_id = %registration.id,
            function_name = ?registration.function_name,
            function_version = ?registration.function_version,
            "Registered with extensions API"
        );
        let id = registration.id;

        if self.cancel_token.is_cancelled() {
            tracing::info!("Cancelled before start, collector not started");
            return Ok(());
        }

        let process = match self.supervisor.start(&self.command).await {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start collector");
                self.api.report_init_error(&id, &e).await;
                return Err(e);
            }
        };

        let exit = self.event_loop(&id, &process).await;

        let (grace, outcome) = match exit {
            LoopExit::Shutdown { reason, budget } => {
                let grace = self.config.grace.clamp(budget);
                tracing::info!(
                    %reason,
                    budget_ms = budget.as_millis(),
                    grace_ms = grace.as_millis(),
                    "Received SHUTDOWN event"
                );
                (grace, Ok(()))
            }
            LoopExit::Cancelled => {
                tracing::info!("Cancelled, shutting down");
                (self.config.grace.max, Ok(()))
            }
            LoopExit::PollFailed(e) => {
                tracing::error!(error = %e, "Polling for next event failed");
                (self.config.grace.max, Err(e))
            }
            LoopExit::Crashed(exit) => {
                tracing::error!(%exit, "Collector exited unexpectedly");
                (self.config.grace.min, Err(ExtensionError::ProcessCrashed(exit)))
            }
        };

        match self.supervisor.stop(&process, grace).await {
            Ok(()) => {}
            Err(e @ ExtensionError::ShutdownTimeout(_)) => {
                tracing::warn!(error = %e, "Collector shutdown timed out, it was terminated");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to stop collector");
            }
        }

        match &outcome {
            Ok(()) => tracing::info!("Run complete"),
            Err(e) => {
                self.api.report_exit_error(&id, e).await;
                tracing::error!(error = %e, "Run complete with error");
            }
        }

        outcome
    }

    async fn event_loop(&self, id: &ExtensionId, process: &S::Process) -> LoopExit {
        let mut invocations: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return LoopExit::Cancelled,
                exit = self.supervisor.exited(process) => return LoopExit::Crashed(exit),
                next = self.api.next_event(id, &self.cancel_token) => next,
            };

            match next {
                Ok(LifecycleEvent::Invoke {
                    request_id,
                    deadline_ms,
                    ..
                }) => {
                    invocations += 1;
                    tracing::debug!(%request_id, deadline_ms, invocations, "Received INVOKE event");
                }
                Ok(LifecycleEvent::Shutdown {
                    shutdown_reason,
                    deadline_ms,
                }) => {
                    return LoopExit::Shutdown {
                        reason: shutdown_reason,
                        budget: remaining_budget(deadline_ms, SystemTime::now()),
                    };
                }
                Err(ExtensionError::Cancelled) => return LoopExit::Cancelled,
                Err(e) => return LoopExit::PollFailed(e),
            }
        }
    }
}
