//! # Configuration Keys and Value Helpers
//!
//! Configuration keys consumed by the server when an explicit value is not
//! supplied, the defaults applied when no key is set, and conversions between
//! plain Rust values and the wire [`Value`] type.
//!
//! ## Key precedence
//!
//! For host and port the more specific `*.server.*` key wins over the shared
//! `tradegate.grpc.*` key, which is also read by clients:
//!
//! | Setting       | First                    | Then                | Default       |
//! |---------------|--------------------------|---------------------|---------------|
//! | host          | [`SERVER_HOST_KEY`]      | [`HOST_KEY`]        | `"localhost"` |
//! | port          | [`SERVER_PORT_KEY`]      | [`PORT_KEY`]        | `0` (auto)    |
//! | max workers   | [`MAX_WORKERS_KEY`]      |                     | `8`           |

use crate::proto::{Value, value::Kind};

/// Shared host key, read by both clients and the server.
pub const HOST_KEY: &str = "tradegate.grpc.host";

/// Server-specific host key, overrides [`HOST_KEY`].
pub const SERVER_HOST_KEY: &str = "tradegate.grpc.server.host";

/// Shared port key, read by both clients and the server.
pub const PORT_KEY: &str = "tradegate.grpc.port";

/// Server-specific port key, overrides [`PORT_KEY`].
pub const SERVER_PORT_KEY: &str = "tradegate.grpc.server.port";

/// Upper bound on concurrently executing controller calls.
pub const MAX_WORKERS_KEY: &str = "tradegate.grpc.server.max_workers";

/// Host used when neither an explicit value nor a key is present.
pub const DEFAULT_HOST: &str = "localhost";

/// Port sentinel meaning "pick any free port at construction".
pub const AUTO_PORT: u16 = 0;

/// Worker count used when neither an explicit value nor a key is present.
pub const DEFAULT_MAX_WORKERS: usize = 8;

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self {
            kind: Some(Kind::StringValue(value.to_owned())),
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self {
            kind: Some(Kind::StringValue(value)),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self {
            kind: Some(Kind::LongValue(value)),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self {
            kind: Some(Kind::DoubleValue(value)),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self {
            kind: Some(Kind::BoolValue(value)),
        }
    }
}

impl Value {
    /// An empty value, used for functions without a meaningful return.
    pub const fn null() -> Self {
        Self { kind: None }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            Some(Kind::StringValue(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.kind {
            Some(Kind::LongValue(v)) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.kind {
            Some(Kind::DoubleValue(v)) => Some(v),
            Some(Kind::LongValue(v)) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.kind {
            Some(Kind::BoolValue(v)) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_match_constructed_kind() {
        assert_eq!(Value::from("abc").as_str(), Some("abc"));
        assert_eq!(Value::from(42_i64).as_i64(), Some(42));
        assert_eq!(Value::from(42_i64).as_f64(), Some(42.0));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::from(1.5).as_str(), None);
        assert!(Value::null().kind.is_none());
    }
}
