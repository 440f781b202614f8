//! Client side of the gateway RPC.

use anyhow::{anyhow, Context, Result};
use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::warn;

use flowgate_types::config::DEFAULT_MAX_MESSAGE_SIZE;
use flowgate_types::request::Request;
use flowgate_types::rpc::{ClientFrame, ServerFrame};

use crate::wire::{self, FrameReader};

#[derive(Debug, Clone)]
pub struct GatewayClient {
    addr: String,
    max_message_size: usize,
}

impl GatewayClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Bridge `requests` through the gateway. Responses arrive in the order
    /// the fabric completes them, not in request order.
    pub async fn call(&self, requests: Vec<Request>) -> Result<BoxStream<'static, Result<Request>>> {
        let max = self.max_message_size;
        let (read_half, write_half) = self.connect().await?.into_split();

        // Written from a separate task so a large batch never blocks on
        // responses the caller has not read yet. The write half stays open
        // until the response stream is dropped: the gateway reads EOF after
        // `end` as the client going away.
        let (done_tx, mut done_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let mut out = wire::writer(write_half, max);
            let send_all = async {
                let frames = std::iter::once(ClientFrame::Call)
                    .chain(requests.into_iter().map(|request| ClientFrame::Request { request }))
                    .chain(std::iter::once(ClientFrame::End));
                for frame in frames {
                    wire::write_frame(&mut out, &frame, max).await?;
                }
                anyhow::Ok(())
            };
            tokio::select! {
                sent = send_all => {
                    if let Err(e) = sent {
                        warn!("Failed to send call frames: {e:#}");
                        return;
                    }
                }
                _ = &mut done_rx => return,
            }
            let _ = done_rx.await;
        });

        Ok(responses(wire::reader(read_half, max), done_tx))
    }

    /// Ask the gateway to start a pea or pod. Yields its log responses until
    /// the processes exit.
    pub async fn spawn(&self, request: Request) -> Result<BoxStream<'static, Result<Request>>> {
        let max = self.max_message_size;
        let (read_half, write_half) = self.connect().await?.into_split();
        let mut out = wire::writer(write_half, max);
        wire::write_frame(&mut out, &ClientFrame::Spawn { request }, max).await?;
        // Closing the write half would cancel the spawn on the gateway side.
        Ok(responses(wire::reader(read_half, max), out))
    }

    async fn connect(&self) -> Result<TcpStream> {
        TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("Failed to connect to gateway at {}", self.addr))
    }
}

/// Response frames until the gateway closes the connection. `keep_open` is
/// held for as long as the stream lives.
fn responses<K>(mut frames: FrameReader<OwnedReadHalf>, keep_open: K) -> BoxStream<'static, Result<Request>>
where
    K: Send + 'static,
{
    let stream = try_stream! {
        let _keep_open = keep_open;
        while let Some(frame) = wire::read_frame::<ServerFrame, _>(&mut frames).await? {
            match frame {
                ServerFrame::Response { request } => yield request,
                ServerFrame::Error { message } => {
                    Err::<(), _>(anyhow!("gateway error: {message}"))?;
                }
            }
        }
    };
    stream.boxed()
}
