//! NDJSON frames exchanged between a client and the gateway.
//!
//! One RPC per connection. A bridging call starts with `Call`, carries any
//! number of `Request` frames and ends with `End` (or the client closing its
//! write half). A spawn call is a single `Spawn` frame. The server answers
//! with `Response` frames and, if the call fails, one final `Error` frame.

use serde::{Deserialize, Serialize};

use crate::request::Request;

/// Client → Gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Call,
    Request { request: Request },
    End,
    Spawn { request: Request },
}

/// Gateway → Client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Response { request: Request },
    Error { message: String },
}
