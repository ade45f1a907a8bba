use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_derive::{Deserialize, Serialize};

// Canonical error codes carried inside Response. The numeric values are
// part of the wire contract and must not change.
pub const SUCCESS: u32 = 200;
pub const CONNECT_CLOSE: u32 = 400;
pub const RPC_NOT_FOUND: u32 = 404;
pub const REQUEST_TIMEOUT: u32 = 408;
pub const INTERNAL_SERVER_ERROR: u32 = 500;
pub const UNKNOWN_ERROR: u32 = 505;
pub const CLIENT_LIMIT: u32 = 506;
pub const SERVICE_LIMIT: u32 = 507;
pub const PARAM_ERROR: u32 = 508;

/// The structured error delivered to callers, and the only error shape
/// that crosses the wire (inside [crate::proto::Response]).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallError {
    pub code: u32,
    pub msg: String,
    pub time: i64,
}

impl CallError {
    pub fn new(code: u32, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into(), time: unix_ts() }
    }

    /// An application-level error a handler returns deliberately.
    /// Never counted by the circuit breaker.
    pub fn app(code: u32, msg: impl Into<String>) -> Self {
        Self::new(code, msg)
    }

    /// Wrap anything that is not already a CallError.
    pub fn wrap<E: fmt::Display>(e: E) -> Self {
        Self::new(UNKNOWN_ERROR, e.to_string())
    }

    /// True for infrastructure/transport failures that count toward the
    /// circuit-breaker statistics. Param errors and application errors
    /// must not fuse a healthy destination.
    #[inline]
    pub fn is_system(&self) -> bool {
        matches!(
            self.code,
            CONNECT_CLOSE
                | RPC_NOT_FOUND
                | REQUEST_TIMEOUT
                | INTERNAL_SERVER_ERROR
                | UNKNOWN_ERROR
                | CLIENT_LIMIT
                | SERVICE_LIMIT
        )
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.msg)
    }
}

impl std::error::Error for CallError {}

pub(crate) fn unix_ts() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}
