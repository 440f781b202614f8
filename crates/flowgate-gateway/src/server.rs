//! RPC listener. One TCP connection per call.
//!
//! The first frame on a connection picks the call: `call` opens a bridging
//! stream fed by the `request` frames that follow until `end` or EOF; `spawn`
//! carries its single request inline. Responses go back as `response` frames.
//! A failing call sends one `error` frame and the connection is closed.
//!
//! Clients keep their write side open while they read. EOF after `end`, or
//! after a `spawn` frame, means the client left and its call is dropped.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowgate_types::request::Request;
use flowgate_types::rpc::{ClientFrame, ServerFrame};

use crate::bridge::Bridge;
use crate::error::GatewayError;
use crate::spawn::Spawner;
use crate::wire::{self, FrameReader, FrameWriter};

/// Everything a connection handler needs, shared across connections.
pub(crate) struct Services {
    pub bridge: Bridge,
    pub spawner: Spawner,
    pub max_message_size: usize,
}

/// Accept connections until `shutdown` fires. In-flight calls are cancelled
/// along with the listener.
pub(crate) async fn serve(listener: TcpListener, services: Arc<Services>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {peer}");
                    let services = Arc::clone(&services);
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => debug!("Call from {peer} cancelled by shutdown"),
                            res = handle_connection(stream, services) => {
                                if let Err(e) = res {
                                    warn!("Connection from {peer} failed: {e:#}");
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!("Failed to accept connection: {e}"),
            }
        }
    }
    info!("RPC listener stopped");
}

async fn handle_connection(stream: TcpStream, services: Arc<Services>) -> Result<()> {
    let max = services.max_message_size;
    let (read_half, write_half) = stream.into_split();
    let mut frames = wire::reader(read_half, max);
    let mut out = wire::writer(write_half, max);

    let opening = match wire::read_frame::<ClientFrame, _>(&mut frames).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(()),
        Err(e) => return fail(&mut out, e, max).await,
    };

    match opening {
        ClientFrame::Call => {
            let (reader_tx, reader_rx) = oneshot::channel();
            let responses = services.bridge.call(inbound_requests(frames, reader_tx)).boxed();
            let gone = async move {
                match reader_rx.await {
                    Ok(frames) => client_gone(frames).await,
                    // EOF ended the inbound stream: nothing left to watch.
                    Err(_) => std::future::pending::<()>().await,
                }
            };
            pump(responses, &mut out, max, gone).await
        }
        ClientFrame::Spawn { request } => {
            let responses = services.spawner.spawn(request).boxed();
            pump(responses, &mut out, max, client_gone(frames)).await
        }
        other => {
            let e = GatewayError::Protocol(format!("unexpected opening frame: {other:?}"));
            fail(&mut out, e.into(), max).await
        }
    }
}

/// The `request` frames of a bridging call, up to `end` or EOF. After `end`
/// the reader is handed back through `reader_tx` so the connection can be
/// watched for the client leaving.
fn inbound_requests(
    mut frames: FrameReader<OwnedReadHalf>,
    reader_tx: oneshot::Sender<FrameReader<OwnedReadHalf>>,
) -> impl Stream<Item = Result<Request>> + Send + 'static {
    try_stream! {
        let mut ended = false;
        while let Some(frame) = wire::read_frame::<ClientFrame, _>(&mut frames).await? {
            match frame {
                ClientFrame::Request { request } => yield request,
                ClientFrame::End => {
                    ended = true;
                    break;
                }
                other => {
                    Err::<(), _>(GatewayError::Protocol(format!("unexpected frame in a call: {other:?}")))?;
                }
            }
        }
        if ended {
            let _ = reader_tx.send(frames);
        }
    }
}

/// Resolves once the client closes its side of the connection or it breaks.
async fn client_gone(mut frames: FrameReader<OwnedReadHalf>) {
    loop {
        match frames.next().await {
            Some(Ok(line)) => debug!("Ignoring frame sent after the call started: {line}"),
            Some(Err(e)) => {
                debug!("Client connection failed: {e}");
                return;
            }
            None => return,
        }
    }
}

/// Write every response, stopping at the first error. If `gone` resolves
/// first the call is dropped, which retires whatever it holds.
async fn pump<G>(
    mut responses: BoxStream<'static, Result<Request>>,
    out: &mut FrameWriter<OwnedWriteHalf>,
    max: usize,
    gone: G,
) -> Result<()>
where
    G: Future<Output = ()>,
{
    tokio::pin!(gone);
    loop {
        let item = tokio::select! {
            item = responses.next() => item,
            _ = &mut gone => {
                info!("Client went away, cancelling its call");
                return Ok(());
            }
        };
        let Some(item) = item else { break };
        let line = item.and_then(|request| wire::encode_frame(&ServerFrame::Response { request }, max));
        match line {
            Ok(line) => wire::write_line(out, line).await?,
            Err(e) => return fail(out, e, max).await,
        }
    }
    SinkExt::<String>::close(out).await?;
    Ok(())
}

async fn fail(out: &mut FrameWriter<OwnedWriteHalf>, e: anyhow::Error, max: usize) -> Result<()> {
    warn!("Call failed: {e:#}");
    let frame = ServerFrame::Error {
        message: format!("{e:#}"),
    };
    wire::write_frame(out, &frame, max).await?;
    SinkExt::<String>::close(out).await?;
    Ok(())
}
