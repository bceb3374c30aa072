use crate::error::OutputError;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// An append-only byte buffer with a single writer and many readers.
///
/// Content is never truncated, so a reader that attaches late can still replay everything from offset 0.
/// Readers don't register with the buffer: each one keeps its own offset and calls `wait` with it.
#[derive(Debug)]
pub struct OutputBuffer {
    inner: RwLock<Inner>,
    progress: watch::Sender<Progress>,
}

#[derive(Debug, Default)]
struct Inner {
    content: Vec<u8>,
    closed: bool,
}

/// What blocked readers need to know to decide whether to wake up.
#[derive(Clone, Copy, Debug, Default)]
struct Progress {
    len: usize,
    closed: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            inner: RwLock::new(Inner::default()),
            progress,
        }
    }

    /// Append `bytes` and wake every blocked reader.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, OutputError> {
        let mut inner = self.write_lock();
        if inner.closed {
            return Err(OutputError::Closed);
        }
        inner.content.extend_from_slice(bytes);
        // published under the lock so a concurrent close can't be overtaken
        self.progress.send_replace(Progress {
            len: inner.content.len(),
            closed: false,
        });
        Ok(bytes.len())
    }

    /// Copy whatever is available at `offset` into `buffer` without blocking.
    ///
    /// `Ok(0)` means nothing new has been written yet. Once the buffer is closed and `offset` is at the end,
    /// `OutputError::EndOfStream` is returned instead.
    pub fn read_partial(&self, buffer: &mut [u8], offset: usize) -> Result<usize, OutputError> {
        let inner = self.read_lock();
        let len = inner.content.len();
        if offset > len {
            return Err(OutputError::OffsetOutOfBounds { offset, len });
        }

        let available = &inner.content[offset..];
        if available.is_empty() && inner.closed {
            return Err(OutputError::EndOfStream);
        }

        let n = available.len().min(buffer.len());
        buffer[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    /// Block until a byte exists at `offset` or the buffer is closed.
    pub async fn wait(&self, offset: usize) {
        let mut progress = self.progress.subscribe();
        // the sender lives as long as `self`, so this can't fail while we hold `&self`
        let _ = progress
            .wait_for(|progress| progress.closed || progress.len > offset)
            .await;
    }

    /// Stop accepting writes and wake every blocked reader. Only the first call succeeds.
    pub fn close(&self) -> Result<(), OutputError> {
        let mut inner = self.write_lock();
        if inner.closed {
            return Err(OutputError::Closed);
        }
        inner.closed = true;
        self.progress.send_replace(Progress {
            len: inner.content.len(),
            closed: true,
        });
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.read_lock().content.len()
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}
