//! Error types for the collector extension.

use crate::client::ApiError;
use crate::supervisor::{ExitInfo, SpawnError};
use std::time::Duration;
use thiserror::Error;

/// A specialised Result type for extension operations.
pub type Result<T> = std::result::Result<T, ExtensionError>;

/// Errors that can occur while running the extension lifecycle.
///
/// `Registration` and `Start` abort before the event loop. `Poll` and
/// `ProcessCrashed` end the loop but the collector is still stopped.
/// `Cancelled` is a shutdown trigger rather than a failure, and
/// `ShutdownTimeout` is only ever logged.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// The Extensions API rejected or failed the registration request.
    #[error("extension registration failed")]
    Registration(#[source] ApiError),

    /// The collector subprocess could not be launched.
    #[error("failed to start collector")]
    Start(#[source] SpawnError),

    /// Polling for the next lifecycle event failed.
    #[error("failed to poll next lifecycle event")]
    Poll(#[source] ApiError),

    /// The surrounding cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The collector exited while it was expected to be running.
    #[error("collector exited unexpectedly ({0})")]
    ProcessCrashed(ExitInfo),

    /// The collector ignored the stop request and had to be killed.
    #[error("collector did not exit within {}ms and was killed", .0.as_millis())]
    ShutdownTimeout(Duration),

    /// Configuration could not be loaded.
    #[error("configuration error")]
    Config(#[source] Box<figment::Error>),
}

impl ExtensionError {
    /// Returns true if this error is the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExtensionError::Cancelled)
    }

    /// Category string used when reporting the error to the Extensions API.
    ///
    /// Lambda expects `Category.Reason`; the category is always `Extension`.
    pub fn error_type(&self) -> &'static str {
        match self {
            ExtensionError::Registration(_) => "Extension.RegistrationFailed",
            ExtensionError::Start(_) => "Extension.CollectorStartFailed",
            ExtensionError::Poll(_) => "Extension.PollFailed",
            ExtensionError::Cancelled => "Extension.Cancelled",
            ExtensionError::ProcessCrashed(_) => "Extension.CollectorCrashed",
            ExtensionError::ShutdownTimeout(_) => "Extension.ShutdownTimeout",
            ExtensionError::Config(_) => "Extension.ConfigInvalid",
        }
    }
}

impl From<figment::Error> for ExtensionError {
    fn from(err: figment::Error) -> Self {
        ExtensionError::Config(Box::new(err))
    }
}
