//! Combined stdout/stderr of a job, readable by any number of independent readers.
mod buffer;
mod reader;

pub use buffer::OutputBuffer;
pub use reader::OutputReader;

/// Size of the chunks produced by `OutputReader::into_stream` for remote readers.
pub const STREAM_CHUNK_SIZE: usize = 1024;
