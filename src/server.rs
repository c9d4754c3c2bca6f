//! Persistent request loop over newline-delimited JSON.
//!
//! One request line in, exactly one response line out, in arrival order.
//! Requests are handled strictly one at a time; while a completion is in
//! flight no further input is read, which keeps response order equal to
//! request order and avoids concurrent load on the endpoint.

use crate::cache::ArtifactCache;
use crate::client::{ChatCompletions, StructuredClient};
use crate::protocol::{self, Command, Parsed};
use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Drives the request loop against a warm client.
pub struct RequestServer<E> {
    client: StructuredClient<E>,
    cache: ArtifactCache,
}

impl<E: ChatCompletions> RequestServer<E> {
    pub fn new(client: StructuredClient<E>) -> Self {
        Self {
            client,
            cache: ArtifactCache::new(),
        }
    }

    /// Run until a quit command or end of input.
    ///
    /// Blank lines are skipped. Every other line gets exactly one response
    /// line, flushed immediately. End of input terminates the loop without
    /// a final line. Failures inside a request degrade to error envelopes
    /// on the output stream; only I/O failures on the streams themselves
    /// abort the loop.
    pub async fn run<R, W>(&mut self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("request loop started; send one JSON object per line");
        let mut lines = reader.lines();
        while let Some(line) = lines
            .next_line()
            .await
            .context("Failed to read request line")?
        {
            if line.trim().is_empty() {
                continue;
            }
            match protocol::parse_line(&line) {
                Parsed::Control(Command::Ping) => {
                    write_line(&mut writer, &protocol::pong_ack()).await?;
                }
                Parsed::Control(Command::Quit) => {
                    write_line(&mut writer, &protocol::bye_ack()).await?;
                    info!("quit command received");
                    break;
                }
                Parsed::Malformed(body) => {
                    write_line(&mut writer, &Value::from(body)).await?;
                }
                Parsed::Request(request) => {
                    debug!("handling request ({} bytes)", line.len());
                    let response = match self.client.infer(&request, &mut self.cache).await {
                        Ok(value) => value,
                        Err(body) => Value::from(body),
                    };
                    write_line(&mut writer, &response).await?;
                }
            }
        }
        info!("request loop finished");
        Ok(())
    }
}

/// Write one compact JSON line and flush it.
///
/// The payload and its newline go out in a single write, so a line-based
/// reader never sees a partial line or waits on a buffer.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(value).context("Failed to encode response line")?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .context("Failed to write response line")?;
    writer
        .flush()
        .await
        .context("Failed to flush response line")?;
    Ok(())
}
