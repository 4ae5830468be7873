//! Size-carrying, close-once byte stream with piggy-backed cleanup hooks
//! (spec.md §4.B).
//!
//! Grounded in the shape of the teacher's `AttachStream`
//! (`environment/docker/environment.rs`, a boxed `AsyncRead` half bundled
//! with cleanup), generalized to the declared-`Size` contract and the
//! close-wrapper combining rule spec.md §9 calls for.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EngineError, Result};

/// Something that can be closed exactly once, asynchronously.
#[async_trait]
pub trait Closer: Send {
    async fn close(&mut self) -> Result<()>;
}

/// A no-op closer for streams with nothing to release.
pub struct NullCloser;

#[async_trait]
impl Closer for NullCloser {
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Closer for Box<dyn Closer> {
    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}

/// A readable byte source of known size, closed exactly once.
///
/// Invariants (spec.md §3): after `close()`, further reads/`out()` return
/// [`EngineError::Other`] carrying "closed"; `out(dst)` copies exactly
/// `size` bytes then closes.
pub struct Stream {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    closer: Box<dyn Closer>,
    size: u64,
    closed: AtomicBool,
}

impl Stream {
    pub fn new(
        reader: impl AsyncRead + Send + 'static,
        size: u64,
        closer: impl Closer + 'static,
    ) -> Self {
        Self {
            reader: Box::pin(reader),
            closer: Box::new(closer),
            size,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_null_closer(reader: impl AsyncRead + Send + 'static, size: u64) -> Self {
        Self::new(reader, size, NullCloser)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Decompose into (reader, size, closer) so a caller can splice a
    /// further cleanup hook onto this stream's close chain (spec.md §4.D
    /// `CloseAfterStream`).
    pub fn into_parts(self) -> (Pin<Box<dyn AsyncRead + Send>>, u64, Box<dyn Closer>) {
        (self.reader, self.size, self.closer)
    }

    /// Copy exactly `size` bytes into `writer`, then close.
    pub async fn out<W: AsyncWrite + Unpin + Send>(&mut self, writer: &mut W) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::Other("stream closed".into()));
        }
        let mut remaining = self.size;
        let mut buf = [0u8; 32 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = self.reader.read(&mut buf[..want]).await?;
            if n == 0 {
                self.close().await?;
                return Err(EngineError::Tar("EOF".into()));
            }
            writer.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        writer.flush().await?;
        self.close().await
    }

    /// Idempotent close. First call runs the inner closer; a second call
    /// returns `Ok(())` (closed is a terminal, observably-success state).
    pub async fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closer.close().await
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        if self.is_closed() {
            return std::task::Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed",
            )));
        }
        self.reader.as_mut().poll_read(cx, buf)
    }
}

/// Wraps a closer with an "after" hook that always runs once the inner
/// closer completes.
///
/// Combining rule (spec.md §3/§9): run inner close, capture its result;
/// run the hook; if inner succeeded, the hook's error (if any) becomes the
/// surfaced error, otherwise the inner error wins.
pub struct CloseWrapper<C, F> {
    inner: Option<C>,
    after: Option<F>,
}

impl<C, F, Fut> CloseWrapper<C, F>
where
    C: Closer,
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    pub fn new(inner: C, after: F) -> Self {
        Self {
            inner: Some(inner),
            after: Some(after),
        }
    }
}

#[async_trait]
impl<C, F, Fut> Closer for CloseWrapper<C, F>
where
    C: Closer + Send,
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn close(&mut self) -> Result<()> {
        let inner_result = match self.inner.take() {
            Some(mut inner) => inner.close().await,
            None => Ok(()),
        };
        let after_result = match self.after.take() {
            Some(after) => after().await,
            None => Ok(()),
        };
        match inner_result {
            Err(e) => Err(e),
            Ok(()) => after_result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn out_copies_exactly_size_bytes_then_closes() {
        let data = b"hello world, extra trailing bytes".to_vec();
        let mut stream = Stream::with_null_closer(Cursor::new(data), 11);

        let mut out = Vec::new();
        stream.out(&mut out).await.unwrap();

        assert_eq!(out, b"hello world");
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn out_short_read_fails_with_eof() {
        let data = b"short".to_vec();
        let mut stream = Stream::with_null_closer(Cursor::new(data), 100);

        let mut out = Vec::new();
        let err = stream.out(&mut out).await.unwrap_err();
        assert!(matches!(err, EngineError::Tar(_)));
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut stream = Stream::with_null_closer(Cursor::new(Vec::new()), 0);
        stream.close().await.unwrap();
        stream.close().await.unwrap();
    }

    struct RecordingCloser {
        log: Arc<AsyncMutex<Vec<&'static str>>>,
        tag: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Closer for RecordingCloser {
        async fn close(&mut self) -> Result<()> {
            self.log.lock().await.push(self.tag);
            if self.fail {
                Err(EngineError::Other(format!("{} failed", self.tag)))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn close_wrapper_runs_inner_then_after_inner_error_wins() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let inner = RecordingCloser {
            log: log.clone(),
            tag: "inner",
            fail: true,
        };
        let log2 = log.clone();
        let mut wrapper = CloseWrapper::new(inner, move || {
            let log2 = log2.clone();
            async move {
                log2.lock().await.push("after");
                Ok(())
            }
        });

        let err = wrapper.close().await.unwrap_err();
        assert_eq!(err.to_string(), "inner failed");
        assert_eq!(*log.lock().await, vec!["inner", "after"]);
    }

    #[tokio::test]
    async fn close_wrapper_after_error_surfaces_when_inner_succeeds() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let inner = RecordingCloser {
            log: log.clone(),
            tag: "inner",
            fail: false,
        };
        let mut wrapper = CloseWrapper::new(inner, || async {
            Err(EngineError::Other("after failed".into()))
        });

        let err = wrapper.close().await.unwrap_err();
        assert_eq!(err.to_string(), "after failed");
    }
}
