//! One request/response exchange against a session's backend connection.
//!
//! Each exchange forwards one chunk of client data to the backend and returns
//! one chunk of backend data. The read side waits only for a short turnaround
//! window, so a quiet backend produces an empty response instead of a hanging
//! request; clients keep polling to drain the stream.

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use std::{io, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::trace;

use crate::session::Session;

/// Writes `body` to the backend, then returns whatever the backend produces
/// within `turnaround`, up to `max_payload` bytes.
///
/// Any error means the backend connection is in an unknown state and the
/// session must be closed. Running out of time while reading is not an error.
pub async fn transact<C>(
    session: &Session<C>,
    body: &[u8],
    max_payload: usize,
    turnaround: Duration,
) -> Result<Bytes>
where
    C: AsyncRead + AsyncWrite + Send,
{
    if !body.is_empty() {
        let mut writer = session.writer.lock().await;
        writer
            .write_all(body)
            .await
            .context("copying body to backend")?;
        writer.flush().await.context("copying body to backend")?;
        trace!(bytes = body.len(), "Wrote request body to backend");
    }

    let mut buffer = BytesMut::zeroed(max_payload);
    let mut reader = session.reader.lock().await;
    let n = match timeout(turnaround, reader.read(&mut buffer)).await {
        Err(_elapsed) => 0,
        Ok(Ok(0)) if max_payload > 0 => bail!(
            "reading from backend: {}",
            io::Error::from(io::ErrorKind::UnexpectedEof)
        ),
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e).context("reading from backend"),
    };
    drop(reader);
    trace!(bytes = n, "Read from backend");

    buffer.truncate(n);
    Ok(buffer.freeze())
}
