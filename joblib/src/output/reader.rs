use super::OutputBuffer;
use crate::error::OutputError;
use crate::types::OutputBlob;
use futures::stream::{self, Stream};
use std::sync::{Arc, Weak};

/// An independent read cursor over an `OutputBuffer`.
///
/// The reader doesn't keep the buffer alive; if the buffer is dropped, reads fail with
/// `OutputError::BufferMissing`. Closing a reader has no effect on the buffer or on other readers.
#[derive(Debug)]
pub struct OutputReader {
    buffer: Weak<OutputBuffer>,
    offset: usize,
    closed: bool,
}

impl OutputReader {
    /// A reader positioned at the start of `buffer`.
    pub fn new(buffer: &Arc<OutputBuffer>) -> Self {
        Self {
            buffer: Arc::downgrade(buffer),
            offset: 0,
            closed: false,
        }
    }

    /// Number of bytes this reader has consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Read the next bytes into `buf`, waiting if none have been written yet.
    ///
    /// Returns `Ok(0)` once every byte has been read and the buffer is closed (or if `buf` is empty).
    /// A single call waits at most once, so it may return early with `Ok(n)` for any `n > 0`.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, OutputError> {
        if self.closed {
            return Err(OutputError::ReaderClosed);
        }
        let buffer = self.buffer.upgrade().ok_or(OutputError::BufferMissing)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut n = match buffer.read_partial(buf, self.offset) {
            Err(OutputError::EndOfStream) => return Ok(0),
            result => result?,
        };
        if n == 0 {
            buffer.wait(self.offset).await;
            n = match buffer.read_partial(buf, self.offset) {
                Err(OutputError::EndOfStream) => return Ok(0),
                result => result?,
            };
        }

        self.offset += n;
        Ok(n)
    }

    /// Read everything up to the end of the stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, OutputError> {
        let mut content = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match self.read(&mut chunk).await? {
                0 => return Ok(content),
                n => content.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Detach from the buffer. Later reads fail with `OutputError::ReaderClosed`.
    pub fn close(&mut self) -> Result<(), OutputError> {
        if self.closed {
            return Err(OutputError::ReaderClosed);
        }
        self.closed = true;
        self.buffer = Weak::new();
        Ok(())
    }

    /// Turn the reader into a stream of chunks of at most `chunk_size` bytes, ending with the output.
    ///
    /// The first error is yielded and ends the stream. Dropping the stream closes the reader.
    pub fn into_stream(
        self,
        chunk_size: usize,
    ) -> impl Stream<Item = Result<OutputBlob, OutputError>> + Send {
        stream::unfold(Some(self), move |reader| async move {
            let mut reader = reader?;
            let mut chunk = vec![0u8; chunk_size];
            match reader.read(&mut chunk).await {
                Ok(0) => None,
                Ok(n) => {
                    chunk.truncate(n);
                    Some((Ok(OutputBlob::from(chunk)), Some(reader)))
                }
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}
