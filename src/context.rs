use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::proto::Request;

/// Per-call context carried from caller to handler: deadline, trace
/// identity, test-traffic flag, source address, auth token and a
/// string-keyed metadata side channel.
#[derive(Clone, Debug, Default)]
pub struct Context {
    ttl: i64,
    /// Absolute deadline, ns since the unix epoch. 0 means unset.
    timeout: i64,
    trace_id: String,
    is_test: bool,
    address: String,
    source: String,
    token: String,
    data: HashMap<String, Vec<u8>>,
}

pub(crate) fn now_ns() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(_) => 0,
    }
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    /// Stamp a deadline `ttl` from now.
    pub fn with_timeout(mut self, ttl: Duration) -> Self {
        self.ttl = ttl.as_nanos() as i64;
        self.timeout = now_ns() + self.ttl;
        self
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn deadline(&self) -> i64 {
        self.timeout
    }

    pub fn expired(&self) -> bool {
        self.timeout != 0 && self.timeout < now_ns()
    }

    /// Time left until the deadline. None when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        if self.timeout == 0 {
            return None;
        }
        let left = self.timeout - now_ns();
        if left <= 0 { Some(Duration::ZERO) } else { Some(Duration::from_nanos(left as u64)) }
    }

    pub fn set_trace_id(&mut self, trace_id: impl Into<String>) {
        self.trace_id = trace_id.into();
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn set_is_test(&mut self, test: bool) {
        self.is_test = test;
    }

    pub fn is_test(&self) -> bool {
        self.is_test
    }

    pub fn set_address(&mut self, address: impl Into<String>) {
        self.address = address.into();
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = source.into();
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.data.insert(key.into(), value);
    }

    pub fn get_data(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(|v| v.as_slice())
    }

    pub fn data(&self) -> &HashMap<String, Vec<u8>> {
        &self.data
    }

    /// Rebuild the caller's context on the serve side from a decoded
    /// request, deadline included.
    pub(crate) fn from_request(req: &Request) -> Self {
        Self {
            ttl: req.ttl,
            timeout: req.timeout,
            trace_id: req.trace_id.clone(),
            is_test: req.is_test,
            address: req.address.clone(),
            source: req.source.clone(),
            token: req.token.clone(),
            data: req.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline() {
        let ctx = Context::background();
        assert!(!ctx.expired());
        assert!(ctx.remaining().is_none());

        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        assert!(!ctx.expired());
        assert!(ctx.remaining().expect("deadline set") > Duration::from_secs(4));

        let ctx = Context::background().with_timeout(Duration::ZERO);
        assert!(ctx.expired() || ctx.remaining() == Some(Duration::ZERO));
    }
}
