//! Shared protocol, error and configuration-key definitions.
//!
//! ## Submodules
//!
//! - [`error`] - Unified error type and its mapping onto `tonic::Status`.
//! - [`types`] - Configuration keys, defaults and [`proto::Value`] helpers.
//! - [`proto`] - Generated `tradegate.ControlService` bindings.

pub mod error;
pub mod types;

pub use error::{Error, Result};

/// gRPC service and message definitions generated from
/// `proto/tradegate.proto`.
///
/// ## Service
///
/// - `Call` - Invokes a named controller function with positional
///   [`Value`](proto::Value) arguments.
/// - `Ping` - Round trip reporting the controller name and the transport
///   generation that served it.
pub mod proto {
    tonic::include_proto!("tradegate");

    /// Encoded descriptor set used to serve gRPC reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("tradegate_descriptor");
}
