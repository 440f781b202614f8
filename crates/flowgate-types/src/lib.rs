pub mod config;
pub mod envelope;
pub mod request;
pub mod rpc;
