//! Lifecycle events delivered by the Extensions API.
//!
//! Mirrors the `/event/next` payloads documented at
//! <https://docs.aws.amazon.com/lambda/latest/dg/runtimes-extensions-api.html>.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Deadlines at or above this value are absolute Unix-epoch milliseconds.
///
/// Lambda reports `deadlineMs` as a wall-clock timestamp, but smaller values
/// are accepted as a relative budget so hosts that send the remaining time
/// directly are handled too. The threshold is early March 1973.
pub const EPOCH_DEADLINE_THRESHOLD_MS: i64 = 100_000_000_000;

/// Event types an extension can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// Sent when a new invocation starts.
    Invoke,
    /// Sent when the execution environment is shutting down.
    Shutdown,
}

/// Reason attached to a SHUTDOWN event.
///
/// Deserialises case-insensitively. Unknown reasons are preserved rather
/// than rejected so a new host value never breaks the shutdown path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Normal spindown of the environment.
    Spindown,
    /// The function timed out.
    Timeout,
    /// The runtime or an extension failed.
    Failure,
    /// A reason this extension does not know about.
    Other(String),
}

impl ShutdownReason {
    /// Returns the wire representation of the reason.
    pub fn as_str(&self) -> &str {
        match self {
            ShutdownReason::Spindown => "spindown",
            ShutdownReason::Timeout => "timeout",
            ShutdownReason::Failure => "failure",
            ShutdownReason::Other(reason) => reason,
        }
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ShutdownReason {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ShutdownReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.to_lowercase().as_str() {
            "spindown" => ShutdownReason::Spindown,
            "timeout" => ShutdownReason::Timeout,
            "failure" => ShutdownReason::Failure,
            _ => ShutdownReason::Other(s),
        })
    }
}

/// X-Ray tracing information attached to INVOKE events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracingInfo {
    /// Header type, `X-Amzn-Trace-Id` on AWS.
    #[serde(rename = "type")]
    pub trace_type: String,
    /// Trace header value.
    pub value: String,
}

/// A lifecycle event returned by `/event/next`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum LifecycleEvent {
    /// A function invocation has started.
    #[serde(rename = "INVOKE")]
    Invoke {
        /// Request ID of the invocation.
        #[serde(rename = "requestId")]
        request_id: String,

        /// Invocation deadline. Informational only.
        #[serde(rename = "deadlineMs")]
        deadline_ms: i64,

        /// ARN of the invoked function.
        #[serde(rename = "invokedFunctionArn", default)]
        invoked_function_arn: String,

        /// X-Ray tracing header, when active tracing is enabled.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracing: Option<TracingInfo>,
    },

    /// The execution environment is about to be shut down.
    #[serde(rename = "SHUTDOWN")]
    Shutdown {
        /// Why the environment is shutting down.
        #[serde(rename = "shutdownReason")]
        shutdown_reason: ShutdownReason,

        /// Deadline for the extension to finish its shutdown work.
        #[serde(rename = "deadlineMs")]
        deadline_ms: i64,
    },
}

impl LifecycleEvent {
    /// Returns the event type of this event.
    pub fn event_type(&self) -> EventType {
        match self {
            LifecycleEvent::Invoke { .. } => EventType::Invoke,
            LifecycleEvent::Shutdown { .. } => EventType::Shutdown,
        }
    }

    /// Time left until this event's deadline, measured from `now`.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        let deadline_ms = match self {
            LifecycleEvent::Invoke { deadline_ms, .. }
            | LifecycleEvent::Shutdown { deadline_ms, .. } => *deadline_ms,
        };
        remaining_budget(deadline_ms, now)
    }
}

/// Converts a reported `deadlineMs` into the time left from `now`.
///
/// Negative values and deadlines already in the past yield zero.
pub fn remaining_budget(deadline_ms: i64, now: SystemTime) -> Duration {
    if deadline_ms <= 0 {
        return Duration::ZERO;
    }

    if deadline_ms < EPOCH_DEADLINE_THRESHOLD_MS {
        return Duration::from_millis(deadline_ms as u64);
    }

    let now_ms = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    Duration::from_millis(deadline_ms.saturating_sub(now_ms).max(0) as u64)
}
