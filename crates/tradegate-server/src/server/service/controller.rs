//! The domain controller exposed over gRPC.
//!
//! A [`Controller`] is a synchronous, possibly slow object (it typically
//! drives an external trading application). Every call runs on a blocking
//! thread of the worker pool, so implementations are free to block.

use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tradegate_core::{Error, Result, proto::Value};

/// Object whose functions are invoked by remote clients.
pub trait Controller: Send + Sync + 'static {
    /// Invokes `function` with positional `arguments`.
    ///
    /// # Errors
    ///
    /// Implementations return [`Error::UnknownFunction`] for names they do
    /// not recognize, [`Error::InvalidRequest`] for bad arguments and
    /// [`Error::Controller`] for failures inside the controller.
    fn call(&self, function: &str, arguments: &[Value]) -> Result<Value>;

    /// Name reported to clients by `Ping`.
    fn name(&self) -> &str {
        "controller"
    }
}

impl<C: Controller> Controller for Arc<C> {
    fn call(&self, function: &str, arguments: &[Value]) -> Result<Value> {
        (**self).call(function, arguments)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Loopback controller used by the bundled binary and the test-suite.
///
/// | function | arguments        | result                          |
/// |----------|------------------|---------------------------------|
/// | `Echo`   | one value        | the same value                  |
/// | `Sum`    | numbers          | integer sum, or float if mixed  |
/// | `Delay`  | milliseconds     | sleeps, then returns the millis |
/// | `Calls`  | none             | calls served so far             |
#[derive(Debug, Default)]
pub struct EchoController {
    calls: AtomicU64,
}

impl EchoController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls served so far, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn sum(arguments: &[Value]) -> Result<Value> {
        let mut int_sum: i64 = 0;
        let mut float_sum = 0.0;
        let mut is_float = false;

        for (i, arg) in arguments.iter().enumerate() {
            if let Some(v) = arg.as_i64() {
                int_sum = int_sum.checked_add(v).ok_or_else(|| Error::InvalidRequest {
                    reason: "Sum overflowed".to_string(),
                })?;
                float_sum += v as f64;
            } else if let Some(v) = arg.as_f64() {
                is_float = true;
                float_sum += v;
            } else {
                return Err(Error::InvalidRequest {
                    reason: format!("Argument {i} of Sum is not a number"),
                });
            }
        }

        Ok(if is_float {
            Value::from(float_sum)
        } else {
            Value::from(int_sum)
        })
    }
}

impl Controller for EchoController {
    fn call(&self, function: &str, arguments: &[Value]) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        match function {
            "Echo" => match arguments {
                [value] => Ok(value.clone()),
                _ => Err(Error::InvalidRequest {
                    reason: format!("Echo takes 1 argument, got {}", arguments.len()),
                }),
            },
            "Sum" => Self::sum(arguments),
            "Delay" => {
                let millis = arguments
                    .first()
                    .and_then(Value::as_i64)
                    .filter(|ms| *ms >= 0)
                    .ok_or_else(|| Error::InvalidRequest {
                        reason: "Delay takes a non-negative number of milliseconds".to_string(),
                    })?;
                std::thread::sleep(Duration::from_millis(millis as u64));
                Ok(Value::from(millis))
            }
            "Calls" => Ok(Value::from(self.calls() as i64)),
            _ => Err(Error::UnknownFunction {
                name: function.to_string(),
            }),
        }
    }

    fn name(&self) -> &str {
        "echo"
    }
}
