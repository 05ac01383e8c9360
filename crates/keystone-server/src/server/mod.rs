//! Server-side wiring around the [`keystone::Coordinator`].
//!
//! - [`config`] - Command-line and environment configuration.
//! - [`service`] - HTTP routes and the error mapping.
//! - [`telemetry`] - Log subscriber plus optional OpenTelemetry export.

pub mod config;
pub mod service;
pub mod telemetry;
