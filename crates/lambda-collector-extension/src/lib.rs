//! AWS Lambda extension that supervises an OpenTelemetry collector.
//!
//! The extension registers with the Lambda Extensions API, launches the
//! collector as a child process, follows INVOKE and SHUTDOWN events, and on
//! shutdown gives the collector a bounded grace period to flush before the
//! execution environment is frozen for good.
//!
//! The [`LifecycleManager`] is generic over the [`ExtensionsApi`] and the
//! [`Supervisor`], with [`ExtensionsClient`] and [`ProcessSupervisor`] as
//! the production implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod supervisor;

pub use client::{ApiError, ExtensionId, ExtensionsApi, ExtensionsClient, Registration};
pub use config::{
    CollectorConfig, CollectorEnv, Config, ConfigBuilder, Deprecation, ExtensionConfig,
    ShutdownConfig,
};
pub use error::{ExtensionError, Result};
pub use event::{EventType, LifecycleEvent, ShutdownReason, TracingInfo};
pub use manager::{GraceBounds, LifecycleManager, ManagerConfig};
pub use supervisor::{
    CollectorCommand, ExitInfo, ProcessState, ProcessSupervisor, SpawnError, SupervisedProcess,
    Supervisor,
};

/// Version reported by `-v` and in logs.
pub const VERSION: &str = match option_env!("LAMBDA_COLLECTOR_EXTENSION_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

/// Commit the binary was built from, when provided at build time.
pub const GIT_HASH: Option<&str> = option_env!("LAMBDA_COLLECTOR_EXTENSION_GIT_HASH");
