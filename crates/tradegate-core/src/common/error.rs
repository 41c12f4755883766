//! Error types for the controller service.
//!
//! This module defines the central `Error` enum, which captures every
//! reportable failure of the service: construction-time configuration and
//! bind failures, lifecycle contract violations, and request-path errors. It
//! implements `From<Error>` for `tonic::Status` so request-path failures reach
//! clients with an appropriate status code.
//!
//! ## Error Cases
//! - `InvalidConfig`: A configuration value is missing a valid form.
//! - `Bind`: The listener could not be bound (port in use, unresolvable host).
//! - `Tls`: Transport credentials could not be loaded.
//! - `Transport`: The transport failed to build or serve.
//! - `DrainTimeout`: A bounded drain did not complete in time.
//! - `TornDown`: The server was already torn down.
//! - `ServiceShutdown`: A call arrived after stop was requested.
//! - `RequestCancelled`: An in-flight call outlived the stop grace period.
//! - `InvalidRequest`: The client request was malformed.
//! - `UnknownFunction`: The controller does not implement the function.
//! - `Controller`: The controller failed while executing a call.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the controller service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A configuration value could not be used.
    #[error("Invalid configuration for `{key}`: {reason}")]
    InvalidConfig { key: String, reason: String },

    /// The listening socket could not be bound.
    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    /// Transport credentials were rejected.
    #[error("TLS error: {reason}")]
    Tls { reason: String },

    /// The transport could not be built or failed while serving.
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// The previous transport did not drain within the configured bound.
    #[error("Transport on {address} did not drain within {timeout_ms}ms")]
    DrainTimeout { address: String, timeout_ms: u128 },

    /// The server was already torn down and its worker pool released.
    #[error("Server has been torn down")]
    TornDown,

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// The call was terminated after the stop grace period expired.
    #[error("Request cancelled")]
    RequestCancelled,

    /// The client request was invalid.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The controller does not know the requested function.
    #[error("Unknown function: {name}")]
    UnknownFunction { name: String },

    /// The controller reported a failure.
    #[error("Controller error: {reason}")]
    Controller { reason: String },
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::UnknownFunction { name } => {
                Status::not_found(format!("Unknown function: {name}"))
            }
            Error::Controller { reason } => Status::internal(reason),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
            Error::RequestCancelled => Status::cancelled("Request was cancelled"),
            other => Status::internal(other.to_string()),
        }
    }
}
