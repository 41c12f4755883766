//! gRPC service implementation and the controller seam.
//!
//! ## Structure
//!
//! - [`controller`] - The [`Controller`](controller::Controller) trait and a
//!   loopback implementation.
//! - [`handler`] - gRPC service entry point (`ControlHandler`).

pub mod controller;
pub mod handler;
