//! Shared runtime plumbing for shellgate binaries

#![deny(missing_docs)]

pub mod telemetry;

pub use telemetry::{init_telemetry, LogFormat, TelemetryConfig, TelemetryError};
