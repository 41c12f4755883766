//! gRPC service implementation dispatching onto the controller.
//!
//! This module defines [`ControlHandler`], the concrete implementation of the
//! [`ControlService`] gRPC service. One handler is built per transport
//! instance and shares that instance's [`CallGate`].
//!
//! ## Responsibilities
//!
//! - Reject calls once the transport has been asked to stop (`UNAVAILABLE`).
//! - Bound concurrent controller calls to the worker pool size.
//! - Run controller calls on blocking threads so a slow controller never
//!   stalls the accept loop.
//! - Terminate in-flight calls with `CANCELLED` when the grace period ends.

use crate::server::{
    service::controller::Controller,
    telemetry::{
        decrement_calls_inflight, increment_call_errors, increment_calls,
        increment_calls_inflight, record_call_duration,
    },
    transport::CallGate,
};
use std::sync::Arc;
use tonic::{
    Request, Response, Status,
    codec::CompressionEncoding,
    transport::{Server, server::Router},
};
use tradegate_core::{
    Error,
    proto::{
        CallRequest, CallResponse, PingRequest, PingResponse, Value,
        control_service_server::{ControlService, ControlServiceServer},
    },
};

/// Request handler bound to one controller and one transport generation.
#[derive(Clone)]
pub struct ControlHandler {
    controller: Arc<dyn Controller>,
    gate: CallGate,
    generation: u64,
}

impl ControlHandler {
    pub(crate) fn new(controller: Arc<dyn Controller>, gate: CallGate, generation: u64) -> Self {
        Self {
            controller,
            gate,
            generation,
        }
    }

    /// Registers this handler with `server`, returning the router to which
    /// further services can be added.
    pub(crate) fn register(self, server: &mut Server) -> Router {
        server.add_service(
            ControlServiceServer::new(self)
                .send_compressed(CompressionEncoding::Zstd)
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Zstd)
                .accept_compressed(CompressionEncoding::Gzip),
        )
    }

    fn reject(err: Error) -> Status {
        let status = Status::from(err);
        increment_call_errors(status.code());
        status
    }

    async fn dispatch(&self, function: String, arguments: Vec<Value>) -> Result<Value, Error> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.gate.permits).acquire_owned() => {
                permit.map_err(|_| Error::ServiceShutdown)?
            }
            () = self.gate.force.cancelled() => return Err(Error::RequestCancelled),
        };

        increment_calls();
        increment_calls_inflight();
        let start = std::time::Instant::now();

        let controller = Arc::clone(&self.controller);
        let task = tokio::task::spawn_blocking(move || {
            // The worker slot stays taken until the controller returns, even
            // if the client has already been answered with CANCELLED.
            let _permit = permit;
            controller.call(&function, &arguments)
        });

        let result = tokio::select! {
            res = task => res
                .map_err(|e| Error::Controller {
                    reason: format!("controller task failed: {e}"),
                })
                .and_then(|r| r),
            () = self.gate.force.cancelled() => Err(Error::RequestCancelled),
        };

        decrement_calls_inflight();
        record_call_duration(start.elapsed().as_secs_f64() * 1000.0);
        result
    }
}

#[tonic::async_trait]
impl ControlService for ControlHandler {
    /// Invokes a controller function on the worker pool.
    ///
    /// If `metrics` is enabled, emits telemetry for:
    /// - admitted calls
    /// - concurrent calls
    /// - call duration
    /// - errors by status code
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(function = %req.get_ref().function, generation = self.generation)))]
    async fn call(&self, req: Request<CallRequest>) -> Result<Response<CallResponse>, Status> {
        if self.gate.is_stopping() {
            return Err(Self::reject(Error::ServiceShutdown));
        }

        let CallRequest {
            function,
            arguments,
        } = req.into_inner();

        if function.trim().is_empty() {
            return Err(Self::reject(Error::InvalidRequest {
                reason: "Function name must not be empty".to_string(),
            }));
        }

        match self.dispatch(function, arguments).await {
            Ok(value) => Ok(Response::new(CallResponse {
                return_value: Some(value),
            })),
            Err(e) => {
                tracing::debug!("Call failed: {e}");
                Err(Self::reject(e))
            }
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(generation = self.generation)))]
    async fn ping(&self, req: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        if self.gate.is_stopping() {
            return Err(Self::reject(Error::ServiceShutdown));
        }

        Ok(Response::new(PingResponse {
            payload: req.into_inner().payload,
            controller: self.controller.name().to_string(),
            generation: self.generation,
        }))
    }
}
