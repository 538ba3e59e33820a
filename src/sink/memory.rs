use std::sync::Arc;

use parking_lot::Mutex;

use super::{decode_snapshot, validate_name, Sink, SinkError};

#[derive(Debug, Default)]
struct MemoryState {
    name: Option<String>,
    latest: Vec<u8>,
    writes: u64,
    opens: u64,
    closes: u64,
}

/// In-process sink that keeps the latest snapshot in memory.
///
/// Useful for embedding without an OS-visible region and for tests: a
/// [`MemorySinkHandle`] observes the sink after it has been moved into a
/// collector.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
    capacity: Option<usize>,
    fail_open: bool,
}

/// Read-only view of a [`MemorySink`].
#[derive(Debug, Clone)]
pub struct MemorySinkHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects writes larger than `capacity` bytes, like a fixed region.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Makes every `open` fail.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn handle(&self) -> MemorySinkHandle {
        MemorySinkHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&mut self, name: &str) -> Result<(), SinkError> {
        validate_name(name)?;

        if self.fail_open {
            return Err(SinkError::Open {
                name: name.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "memory sink configured to fail",
                ),
            });
        }

        let mut state = self.state.lock();
        state.name = Some(name.to_string());
        state.opens += 1;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if state.name.is_none() {
            return Err(SinkError::NotOpen);
        }

        if let Some(capacity) = self.capacity {
            if bytes.len() > capacity {
                return Err(SinkError::Overflow {
                    len: bytes.len(),
                    capacity,
                });
            }
        }

        state.latest.clear();
        state.latest.extend_from_slice(bytes);
        state.writes += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if state.name.take().is_some() {
            state.closes += 1;
        }
    }
}

impl MemorySinkHandle {
    /// Bytes of the most recent successful write.
    pub fn latest_bytes(&self) -> Vec<u8> {
        self.state.lock().latest.clone()
    }

    /// The most recent snapshot decoded into integers.
    pub fn latest(&self) -> Vec<i32> {
        decode_snapshot(&self.state.lock().latest)
    }

    /// Number of successful writes.
    pub fn writes(&self) -> u64 {
        self.state.lock().writes
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().name.is_some()
    }

    /// Name passed to the last successful `open`, while open.
    pub fn region_name(&self) -> Option<String> {
        self.state.lock().name.clone()
    }

    pub fn opens(&self) -> u64 {
        self.state.lock().opens
    }

    pub fn closes(&self) -> u64 {
        self.state.lock().closes
    }
}
