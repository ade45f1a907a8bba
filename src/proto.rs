//! The Request/Response records exchanged after framing. The envelope
//! itself is always msgpack; `code` selects the codec of the `arg` /
//! `reply` payload only. Fields may be appended but existing meanings
//! are frozen.

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

use crate::error::CallError;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Request {
    /// Opaque unique call id, caller-generated.
    pub id: String,
    /// Logical service name.
    pub name: String,
    pub method: String,
    /// Time-to-live in nanoseconds.
    pub ttl: i64,
    /// Absolute deadline, nanoseconds since the unix epoch.
    pub timeout: i64,
    pub trace_id: String,
    pub is_test: bool,
    /// Address of the originating caller.
    pub address: String,
    pub source: String,
    /// String-keyed side channel for cross-cutting metadata.
    pub data: HashMap<String, Vec<u8>>,
    pub token: String,
    /// Codec tag for `arg`/`reply` ("msgpack" default, "json").
    pub code: String,
    pub arg: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub name: String,
    pub method: String,
    pub code: String,
    pub reply: Option<Vec<u8>>,
    pub error: Option<CallError>,
}

impl Response {
    /// Reply template echoing the request's correlation fields.
    pub fn reply_to(req: &Request) -> Self {
        Self {
            id: req.id.clone(),
            name: req.name.clone(),
            method: req.method.clone(),
            code: req.code.clone(),
            reply: None,
            error: None,
        }
    }

    /// A locally synthesized failure (connection loss, shutdown, ...).
    pub fn failure(id: String, name: String, method: String, err: CallError) -> Self {
        Self { id, name, method, code: String::new(), reply: None, error: Some(err) }
    }
}
