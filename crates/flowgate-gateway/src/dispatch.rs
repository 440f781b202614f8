//! Driver dispatch applied to every message coming back from the fabric.
//!
//! The gateway itself carries no drivers by default, so most messages take
//! the no-driver path and are handed back to the client with the envelope
//! stripped.

use std::collections::HashMap;

use thiserror::Error;

use flowgate_types::{
    envelope::Message,
    request::{Request, RequestKind},
};

/// Signals a driver can raise instead of returning a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Only part of a multi-part message has arrived.
    #[error("partial message pending")]
    WaitPending,
    /// A request loop asked to terminate.
    #[error("request loop end")]
    LoopEnd,
    #[error("no driver for {0} requests")]
    NoDriver(RequestKind),
}

/// Interprets a message returned by the fabric.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, msg: &Message) -> Result<Request, DispatchError>;
}

/// A single driver, bound to one request kind.
pub trait Driver: Send + Sync {
    fn apply(&self, msg: &Message) -> Result<Request, DispatchError>;
}

impl<F> Driver for F
where
    F: Fn(&Message) -> Result<Request, DispatchError> + Send + Sync,
{
    fn apply(&self, msg: &Message) -> Result<Request, DispatchError> {
        self(msg)
    }
}

/// Drivers keyed by request kind.
#[derive(Default)]
pub struct DriverTable {
    drivers: HashMap<RequestKind, Box<dyn Driver>>,
}

impl DriverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `driver` for `kind`, replacing any previous one.
    pub fn with_driver(mut self, kind: RequestKind, driver: impl Driver + 'static) -> Self {
        self.drivers.insert(kind, Box::new(driver));
        self
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl Dispatch for DriverTable {
    fn dispatch(&self, msg: &Message) -> Result<Request, DispatchError> {
        let kind = msg.request.kind();
        match self.drivers.get(&kind) {
            Some(driver) => driver.apply(msg),
            None => Err(DispatchError::NoDriver(kind)),
        }
    }
}
