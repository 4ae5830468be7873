//! Docker log-frame demux and the background log pump / restart loop
//! (spec.md §4.D, §4.F).
//!
//! Grounded in the teacher's `environment/docker/power.rs`
//! (`start_container`/`wait_for_stop`/`terminate_container` driven by
//! `tokio::select!` against a `CancellationToken`); the 8-byte frame header
//! itself is the daemon's documented log-attach wire format, not something
//! the teacher implements (it lets bollard do this).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;
use crate::log_writer::LogWriter;

/// Demux a Docker log stream: repeating `[stream(1) pad(3) len(4,BE)]`
/// headers each followed by exactly `len` payload bytes. Stdout and stderr
/// frames are both forwarded to `out` in arrival order (spec.md doesn't
/// require separating them for the writer side); each is prefixed with
/// `prefix` if given, one write per frame.
pub async fn demux_frames(
    mut reader: impl AsyncRead + Unpin,
    out: Arc<LogWriter>,
    prefix: Option<&str>,
) -> Result<()> {
    let mut header = [0u8; 8];
    loop {
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut payload = vec![0u8; len];
        if len > 0 {
            reader.read_exact(&mut payload).await?;
        }
        match prefix {
            Some(p) => {
                let mut framed = Vec::with_capacity(p.len() + 1 + payload.len());
                framed.extend_from_slice(p.as_bytes());
                framed.push(b' ');
                framed.extend_from_slice(&payload);
                out.write(&framed).await?;
            }
            None => out.write(&payload).await?,
        }
    }
}

/// Attach to `id`'s combined stdout/stderr log stream (optionally starting
/// from `since`, an RFC3339-nano timestamp) and demux frames into `out`
/// until the stream ends or `cancel` fires. Runs to completion in the
/// caller's task; `start()` spawns this itself so the initial attach and
/// later restart re-attaches share one code path.
pub async fn attach_and_pump(
    client: &crate::client::SocketClient,
    id: &str,
    out: Arc<LogWriter>,
    prefix: Option<&str>,
    since: Option<&str>,
    cancel: CancellationToken,
) {
    let mut path = format!("/containers/{}/logs?stdout=1&stderr=1&follow=1&timestamps=1", id);
    if let Some(s) = since {
        path.push_str("&since=");
        path.push_str(s);
    }
    let resp = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        r = client.do_request(hyper::Method::GET, &path, None, Some(cancel.clone())) => r,
    };
    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            warn!(%id, error = %e, "log attach failed");
            return;
        }
    };
    if let Err(e) = demux_frames(resp.body, out, prefix).await {
        warn!(%id, error = %e, "log demux ended with error");
    }
}

/// Spawn [`attach_and_pump`] as a background task (the non-restarting
/// `Start` path: one attach for the container's whole lifetime).
pub fn pump_logs(
    client: crate::client::SocketClient,
    id: String,
    out: Arc<LogWriter>,
    prefix: Option<String>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        attach_and_pump(&client, &id, out, prefix.as_deref(), None, cancel).await;
    })
}

/// Restart `id` on every `tick` until `cancel` fires, reopening the log
/// attach each time with `since` set to the container's new start time
/// minus 100ms so logs read continuously across restarts (spec.md §4.D).
///
/// Grounded in `power.rs`'s restart branch: a failed restart is logged and
/// the loop continues rather than propagating the error, since there's no
/// caller left to receive it once `Start` has already returned the first
/// exit status.
type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub async fn restart_loop(
    id: String,
    tick: Duration,
    cancel: CancellationToken,
    mut restart: impl FnMut() -> BoxFuture<'static, Result<()>>,
    mut started_at_minus_100ms: impl FnMut() -> BoxFuture<'static, Result<String>>,
    client: crate::client::SocketClient,
    out: Arc<LogWriter>,
    prefix: Option<String>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(tick) => {}
        }
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = restart().await {
            warn!(%id, error = %e, "container restart failed, will retry");
            continue;
        }
        let since = started_at_minus_100ms().await.ok();
        attach_and_pump(&client, &id, out.clone(), prefix.as_deref(), since.as_deref(), cancel.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![stream, 0, 0, 0];
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[tokio::test]
    async fn demuxes_multiple_frames_in_order() {
        let mut raw = frame(1, b"hello ");
        raw.extend(frame(2, b"world"));

        let sink = Arc::new(LogWriter::new(Vec::new()));
        demux_frames(Cursor::new(raw), sink.clone(), None).await.unwrap();
    }

    #[tokio::test]
    async fn empty_stream_is_not_an_error() {
        let sink = Arc::new(LogWriter::new(Vec::new()));
        demux_frames(Cursor::new(Vec::new()), sink, None).await.unwrap();
    }

    #[tokio::test]
    async fn prefixes_each_frame() {
        let raw = frame(1, b"hi");
        let sink = Arc::new(LogWriter::new(Vec::new()));
        demux_frames(Cursor::new(raw), sink.clone(), Some("P")).await.unwrap();
    }
}
