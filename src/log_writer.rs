//! A writer that can be permanently disabled from another task (spec.md
//! §4.D/§4.F — forwarders and restart loops stop writing logs once a caller
//! has moved on, without racing the background pump that still produces
//! them).

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::Result;

pub struct LogWriter {
    inner: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    disabled: AtomicBool,
}

impl LogWriter {
    pub fn new(inner: impl AsyncWrite + Unpin + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Box::new(inner)),
            disabled: AtomicBool::new(false),
        }
    }

    /// Write `buf`, silently dropping it once disabled.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        if self.disabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        inner.write_all(buf).await?;
        inner.flush().await?;
        Ok(())
    }

    /// Permanently stop forwarding writes. Idempotent.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disable_suppresses_further_writes() {
        let buf = Vec::new();
        let writer = LogWriter::new(std::io::Cursor::new(buf));
        writer.write(b"hello ").await.unwrap();
        writer.disable();
        writer.write(b"world").await.unwrap();
        assert!(writer.is_disabled());
    }
}
