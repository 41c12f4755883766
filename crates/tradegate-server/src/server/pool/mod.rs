//! Worker pool shared by every transport instance of a server.
//!
//! - [`manager`] - The [`WorkerPool`](manager::WorkerPool) runtime handle.

pub mod manager;
