use thiserror::Error;

/// Errors that fail a single RPC call. None of them take the gateway down.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("don't know how to handle {0}")]
    BadRequestType(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fabric connection is closed")]
    FabricClosed,
}
