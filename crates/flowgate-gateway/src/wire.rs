//! NDJSON framing shared by the server and the client.
//!
//! `LinesCodec` caps inbound lines; outbound lines are checked here since
//! the codec's encoder does not.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::error::GatewayError;

pub type FrameReader<R> = FramedRead<R, LinesCodec>;
pub type FrameWriter<W> = FramedWrite<W, LinesCodec>;

pub fn reader<R: AsyncRead>(inner: R, max_message_size: usize) -> FrameReader<R> {
    FramedRead::new(inner, LinesCodec::new_with_max_length(max_message_size))
}

pub fn writer<W: AsyncWrite>(inner: W, max_message_size: usize) -> FrameWriter<W> {
    FramedWrite::new(inner, LinesCodec::new_with_max_length(max_message_size))
}

/// Read the next frame. `Ok(None)` means the peer closed its side.
pub async fn read_frame<T, R>(frames: &mut FrameReader<R>) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    loop {
        let line = match frames.next().await {
            Some(line) => line.map_err(|e| GatewayError::Protocol(e.to_string()))?,
            None => return Ok(None),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let frame = serde_json::from_str(trimmed)
            .map_err(|e| GatewayError::Protocol(format!("malformed frame: {e}")))?;
        return Ok(Some(frame));
    }
}

/// Serialize a frame, refusing anything over the size limit.
pub fn encode_frame<T: Serialize>(frame: &T, max_message_size: usize) -> Result<String> {
    let line = serde_json::to_string(frame).context("Failed to serialize frame")?;
    if line.len() > max_message_size {
        return Err(GatewayError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            line.len(),
            max_message_size
        ))
        .into());
    }
    Ok(line)
}

pub async fn write_line<W>(frames: &mut FrameWriter<W>, line: String) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    frames.send(line).await.context("Failed to write frame")?;
    Ok(())
}

pub async fn write_frame<T, W>(frames: &mut FrameWriter<W>, frame: &T, max_message_size: usize) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let line = encode_frame(frame, max_message_size)?;
    write_line(frames, line).await
}
