pub mod memory;
pub mod shm;

use std::io;

use thiserror::Error;

pub use self::memory::{MemorySink, MemorySinkHandle};
pub use self::shm::SharedMemorySink;

/// Size in bytes of one published snapshot value.
pub const SNAPSHOT_WORD_SIZE: usize = std::mem::size_of::<i32>();

/// Errors raised by sink implementations.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("invalid sink name {0:?}")]
    InvalidName(String),

    #[error("sink is not open")]
    NotOpen,

    #[error("snapshot of {len} bytes exceeds region capacity of {capacity} bytes")]
    Overflow { len: usize, capacity: usize },

    #[error("opening sink {name:?}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("sink I/O: {0}")]
    Io(#[from] io::Error),
}

/// Sink receives serialized snapshots and makes them visible to readers
/// outside the process.
///
/// Only the collector context touches a sink, so implementations need no
/// internal synchronization.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Creates or attaches to the named region.
    fn open(&mut self, name: &str) -> Result<(), SinkError>;

    /// Overwrites the region with `bytes`.
    fn write(&mut self, bytes: &[u8]) -> Result<(), SinkError>;

    /// Releases the region. Safe to call when never opened, and repeatedly.
    fn close(&mut self);
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self, name: &str) -> Result<(), SinkError> {
        (**self).open(name)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        (**self).write(bytes)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Encodes snapshot values into `out` as native-endian 4-byte integers.
///
/// No header and no length prefix: readers know the schema out-of-band.
pub fn encode_snapshot(values: &[i32], out: &mut Vec<u8>) {
    out.reserve(values.len() * SNAPSHOT_WORD_SIZE);
    for v in values {
        out.extend_from_slice(&v.to_ne_bytes());
    }
}

/// Decodes a snapshot produced by [`encode_snapshot`].
///
/// A trailing partial word is ignored.
pub fn decode_snapshot(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(SNAPSHOT_WORD_SIZE)
        .map(|chunk| {
            let mut word = [0u8; SNAPSHOT_WORD_SIZE];
            word.copy_from_slice(chunk);
            i32::from_ne_bytes(word)
        })
        .collect()
}

/// Rejects names that would escape the region namespace.
pub(crate) fn validate_name(name: &str) -> Result<(), SinkError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(SinkError::InvalidName(name.to_string()));
    }
    Ok(())
}
