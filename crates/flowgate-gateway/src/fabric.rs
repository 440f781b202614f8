//! Messaging fabric client.
//!
//! A bridging call holds one [`FabricLink`] for its whole lifetime. The
//! built-in [`TcpFabric`] speaks NDJSON: every line is one JSON [`Message`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use flowgate_types::envelope::Message;

use crate::error::GatewayError;
use crate::wire::{self, FrameReader, FrameWriter};

/// Opens connections to the fabric.
#[async_trait]
pub trait Fabric: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn FabricLink>>;
}

/// One open fabric connection.
#[async_trait]
pub trait FabricLink: Send + Sync {
    /// Send `msg` once `delay` has elapsed. Fails if the link is closed
    /// before or while waiting.
    async fn send(&self, msg: Message, delay: Duration) -> Result<()>;

    /// Wait for the next message coming back from the fabric.
    async fn recv(&self) -> Result<Message>;

    /// Close the link. Pending sends and receives fail promptly.
    fn close(&self);
}

/// Closes the link when dropped, whatever way the owning call ends.
pub struct LinkGuard(pub Arc<dyn FabricLink>);

impl Drop for LinkGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

// ─── TCP transport ────────────────────────────────────────────────────────────

pub struct TcpFabric {
    addr: String,
    max_message_size: usize,
}

impl TcpFabric {
    pub fn new(addr: impl Into<String>, max_message_size: usize) -> Self {
        Self {
            addr: addr.into(),
            max_message_size,
        }
    }
}

#[async_trait]
impl Fabric for TcpFabric {
    async fn connect(&self) -> Result<Arc<dyn FabricLink>> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("Failed to connect to fabric at {}", self.addr))?;
        stream.set_nodelay(true).ok();
        debug!("Fabric link opened to {}", self.addr);
        Ok(Arc::new(TcpLink::new(stream, self.max_message_size)))
    }
}

pub struct TcpLink {
    writer: Mutex<FrameWriter<OwnedWriteHalf>>,
    reader: Mutex<FrameReader<OwnedReadHalf>>,
    max_message_size: usize,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl TcpLink {
    pub fn new(stream: TcpStream, max_message_size: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            writer: Mutex::new(wire::writer(write_half, max_message_size)),
            reader: Mutex::new(wire::reader(read_half, max_message_size)),
            max_message_size,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::FabricClosed.into());
        }
        Ok(())
    }
}

#[async_trait]
impl FabricLink for TcpLink {
    async fn send(&self, msg: Message, delay: Duration) -> Result<()> {
        self.ensure_open()?;
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return Err(GatewayError::FabricClosed.into()),
            }
        }
        self.ensure_open()?;

        let line = wire::encode_frame(&msg, self.max_message_size)?;
        let mut writer = self.writer.lock().await;
        wire::write_line(&mut writer, line)
            .await
            .context("Failed to send message to fabric")
    }

    async fn recv(&self) -> Result<Message> {
        self.ensure_open()?;
        let mut reader = self.reader.lock().await;
        loop {
            let next = tokio::select! {
                next = reader.next() => next,
                _ = self.shutdown.cancelled() => return Err(GatewayError::FabricClosed.into()),
            };
            let line = match next {
                Some(line) => line.context("Failed to read from fabric")?,
                None => anyhow::bail!("Fabric closed the connection"),
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let msg = serde_json::from_str(trimmed)
                .with_context(|| format!("Failed to parse fabric message: {trimmed}"))?;
            return Ok(msg);
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
            debug!("Fabric link closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_types::{
        envelope::add_envelope,
        request::{ControlRequest, Request, RequestBody},
    };
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn control(cmd: &str) -> Message {
        add_envelope(
            Request::new(RequestBody::Control(ControlRequest {
                command: cmd.into(),
            })),
            "gateway",
            "test",
        )
    }

    /// Echoes every line straight back.
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut lines = BufReader::new(r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                w.write_all(line.as_bytes()).await.unwrap();
                w.write_all(b"\n").await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn tcp_link_roundtrip() {
        let addr = echo_server().await;
        let link = TcpFabric::new(addr, 1024 * 1024).connect().await.unwrap();

        let sent = control("ping");
        link.send(sent.clone(), Duration::ZERO).await.unwrap();
        assert_eq!(link.recv().await.unwrap(), sent);
    }

    #[tokio::test]
    async fn closed_link_rejects_send_and_wakes_recv() {
        let addr = echo_server().await;
        let link = TcpFabric::new(addr, 1024 * 1024).connect().await.unwrap();

        let pending = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.recv().await })
        };
        tokio::task::yield_now().await;

        link.close();
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.downcast_ref::<GatewayError>().is_some());
        assert!(link.send(control("late"), Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn close_interrupts_delayed_send() {
        let addr = echo_server().await;
        let link = TcpFabric::new(addr, 1024 * 1024).connect().await.unwrap();

        let sending = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.send(control("slow"), Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        link.close();

        let res = tokio::time::timeout(Duration::from_secs(2), sending)
            .await
            .expect("send should be interrupted")
            .unwrap();
        assert!(res.is_err());
    }
}
