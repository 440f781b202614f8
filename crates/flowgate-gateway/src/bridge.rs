//! Relays a client's request stream onto the fabric and
//! streams the answers back as they complete.
//!
//! Every request gets exactly one send and one receive. Sends are paced:
//! the request at index `idx` goes out no earlier than `idx × sleep` after
//! the call started. Answers are yielded in completion order, so the bridge
//! relies on the fabric returning one message per request and must never sit
//! in front of a reducing topology.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_stream::try_stream;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, error};

use flowgate_types::{
    envelope::{add_envelope, Message},
    request::Request,
};

use crate::dispatch::{Dispatch, DispatchError};
use crate::fabric::{Fabric, LinkGuard};

/// Origin identity stamped on every envelope the gateway creates.
pub const GATEWAY_SENDER: &str = "gateway";

#[derive(Clone)]
pub struct Bridge {
    fabric: Arc<dyn Fabric>,
    dispatch: Arc<dyn Dispatch>,
    identity: String,
    sleep: Duration,
}

enum Event {
    Inbound(Option<Result<Request>>),
    Sent(Result<()>),
    Received(Result<Message>),
}

impl Bridge {
    pub fn new(
        fabric: Arc<dyn Fabric>,
        dispatch: Arc<dyn Dispatch>,
        identity: impl Into<String>,
        sleep: Duration,
    ) -> Self {
        Self {
            fabric,
            dispatch,
            identity: identity.into(),
            sleep,
        }
    }

    /// Interpret one message coming back from the fabric.
    ///
    /// Returns `None` when the message must be dropped.
    pub fn recv_callback(&self, msg: Message) -> Option<Request> {
        match self.dispatch.dispatch(&msg) {
            Ok(response) => Some(response),
            Err(DispatchError::WaitPending) => {
                error!("gateway should not receive partial message, it can not do reduce");
                None
            }
            Err(DispatchError::LoopEnd) => {
                error!("event loop end signal should not be raised in the gateway");
                None
            }
            Err(DispatchError::NoDriver(kind)) => {
                debug!("No driver for {kind} request, returning it unchanged");
                Some(msg.into_request())
            }
        }
    }

    /// Run one bridging call over `inbound`.
    ///
    /// The fabric link lives exactly as long as the returned stream; dropping
    /// the stream closes it and abandons every pending send and receive.
    pub fn call<S>(&self, inbound: S) -> impl Stream<Item = Result<Request>> + Send + 'static
    where
        S: Stream<Item = Result<Request>> + Send + 'static,
    {
        let bridge = self.clone();
        try_stream! {
            let link = bridge.fabric.connect().await?;
            let _guard = LinkGuard(Arc::clone(&link));
            let started = Instant::now();

            let mut inbound = Box::pin(inbound);
            let mut inbound_open = true;
            let mut sends = FuturesUnordered::new();
            let mut recvs = FuturesUnordered::new();
            let mut forwarded: u32 = 0;

            loop {
                let event = tokio::select! {
                    next = inbound.next(), if inbound_open => Event::Inbound(next),
                    Some(sent) = sends.next(), if !sends.is_empty() => Event::Sent(sent),
                    Some(received) = recvs.next(), if !recvs.is_empty() => Event::Received(received),
                    else => break,
                };

                match event {
                    Event::Inbound(Some(request)) => {
                        let request = request?;
                        let msg = add_envelope(request, GATEWAY_SENDER, &bridge.identity);
                        let due = started + bridge.sleep.saturating_mul(forwarded);
                        let delay = due.saturating_duration_since(Instant::now());
                        forwarded = forwarded.saturating_add(1);

                        let out = Arc::clone(&link);
                        sends.push(async move { out.send(msg, delay).await });
                        let back = Arc::clone(&link);
                        recvs.push(async move { back.recv().await });
                    }
                    Event::Inbound(None) => {
                        debug!("Inbound stream finished after {forwarded} requests");
                        inbound_open = false;
                    }
                    Event::Sent(sent) => sent?,
                    Event::Received(received) => {
                        if let Some(response) = bridge.recv_callback(received?) {
                            yield response;
                        }
                    }
                }
            }
        }
    }
}
