//! Server components.
//!
//! - [`net`] - Address classification and free-port discovery.
//! - [`pool`] - The worker pool shared by every transport instance.
//! - [`service`] - The controller seam and the gRPC request handler.
//! - [`transport`] - One bound, single-use gRPC transport and its stop handle.
//! - [`lifecycle`] - [`ServiceServer`](lifecycle::ServiceServer), the
//!   restartable server built from the pieces above.
//! - [`config`] - Configuration stores and the binary's command line.
//! - [`credentials`] - TLS material.
//! - [`telemetry`] - Logging and optional OpenTelemetry export.

pub mod config;
pub mod credentials;
pub mod lifecycle;
pub mod net;
pub mod pool;
pub mod service;
pub mod telemetry;
pub mod transport;
