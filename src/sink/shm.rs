use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::{debug, info, warn};

use super::{decode_snapshot, validate_name, Sink, SinkError, SNAPSHOT_WORD_SIZE};

/// Default directory for named regions. On Linux this is a tmpfs shared
/// by every process on the host.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Default region size in bytes.
pub const DEFAULT_SHM_CAPACITY: usize = 1024;

/// An open, mapped region.
struct Region {
    name: String,
    path: PathBuf,
    map: MmapMut,
}

/// Sink backed by a fixed-size, memory-mapped file in a shared directory.
///
/// External monitoring tools map the same file and read the latest
/// snapshot. Every write replaces the region contents from offset zero and
/// zeroes whatever follows, so readers never see integers left over from a
/// longer previous snapshot.
pub struct SharedMemorySink {
    dir: PathBuf,
    capacity: usize,
    region: Option<Region>,
}

impl SharedMemorySink {
    /// Creates an unopened sink placing regions under `dir`.
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            dir: dir.into(),
            capacity,
            region: None,
        }
    }

    /// Region size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Path of the currently open region, if any.
    pub fn path(&self) -> Option<&Path> {
        self.region.as_ref().map(|r| r.path.as_path())
    }

    pub fn is_open(&self) -> bool {
        self.region.is_some()
    }

    fn map_region(&self, name: &str) -> Result<Region, SinkError> {
        let open_err = |source: io::Error| SinkError::Open {
            name: name.to_string(),
            source,
        };

        if self.capacity == 0 {
            return Err(open_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region capacity must be positive",
            )));
        }

        let path = self.dir.join(name);
        let file = open_region_file(&path).map_err(open_err)?;

        let len = file.metadata().map_err(open_err)?.len();
        if len < self.capacity as u64 {
            file.set_len(self.capacity as u64).map_err(open_err)?;
        }

        // SAFETY: the mapping covers exactly `capacity` bytes, which the file
        // was just sized to hold. Other processes may write the same file;
        // we only ever copy bytes in and never hand out references into the
        // mapping, so concurrent external modification cannot violate Rust
        // aliasing rules on our side.
        let map = unsafe { MmapOptions::new().len(self.capacity).map_mut(&file) }
            .map_err(open_err)?;

        Ok(Region {
            name: name.to_string(),
            path,
            map,
        })
    }
}

impl Default for SharedMemorySink {
    fn default() -> Self {
        Self::new(DEFAULT_SHM_DIR, DEFAULT_SHM_CAPACITY)
    }
}

impl Sink for SharedMemorySink {
    fn name(&self) -> &str {
        "shared_memory"
    }

    fn open(&mut self, name: &str) -> Result<(), SinkError> {
        validate_name(name)?;

        if let Some(region) = &self.region {
            if region.name == name {
                return Ok(());
            }
            self.close();
        }

        let region = self.map_region(name)?;
        info!(
            path = %region.path.display(),
            capacity = self.capacity,
            "shared memory region mapped",
        );
        self.region = Some(region);

        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let region = self.region.as_mut().ok_or(SinkError::NotOpen)?;
        let capacity = region.map.len();

        if bytes.len() > capacity {
            return Err(SinkError::Overflow {
                len: bytes.len(),
                capacity,
            });
        }

        region.map[..bytes.len()].copy_from_slice(bytes);
        region.map[bytes.len()..].fill(0);

        Ok(())
    }

    fn close(&mut self) {
        let Some(region) = self.region.take() else {
            return;
        };

        // Only matters for regions outside tmpfs; cheap otherwise.
        if let Err(e) = region.map.flush() {
            warn!(path = %region.path.display(), error = %e, "flushing region on close");
        }

        debug!(path = %region.path.display(), "shared memory region unmapped");
    }
}

impl Drop for SharedMemorySink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
fn open_region_file(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    // Readable and writable by any local monitoring tool (subject to umask).
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o666)
        .open(path)
}

#[cfg(not(unix))]
fn open_region_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Reads up to `count` snapshot values from the named region.
///
/// `None` decodes the whole region. This is the reader side used by the
/// `dump` command; it maps the file read-only and never modifies it.
pub fn read_snapshot(dir: &Path, name: &str, count: Option<usize>) -> Result<Vec<i32>, SinkError> {
    validate_name(name)?;

    let path = dir.join(name);
    let file = File::open(&path).map_err(|source| SinkError::Open {
        name: name.to_string(),
        source,
    })?;

    if file.metadata()?.len() == 0 {
        return Ok(Vec::new());
    }

    // SAFETY: read-only mapping; bytes are copied out before the map drops.
    let map = unsafe { Mmap::map(&file) }?;

    let limit = match count {
        Some(n) => (n * SNAPSHOT_WORD_SIZE).min(map.len()),
        None => map.len(),
    };

    Ok(decode_snapshot(&map[..limit]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::encode_snapshot;

    fn encoded(values: &[i32]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_snapshot(values, &mut out);
        out
    }

    #[test]
    fn test_open_creates_sized_region() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = SharedMemorySink::new(dir.path(), 64);

        sink.open("region_a").expect("open");
        assert!(sink.is_open());

        let meta = std::fs::metadata(dir.path().join("region_a")).expect("metadata");
        assert_eq!(meta.len(), 64);
    }

    #[test]
    fn test_write_then_read_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = SharedMemorySink::new(dir.path(), 64);
        sink.open("region_b").expect("open");

        sink.write(&encoded(&[3, 1000, -5])).expect("write");

        let values = read_snapshot(dir.path(), "region_b", Some(3)).expect("read");
        assert_eq!(values, vec![3, 1000, -5]);
    }

    #[test]
    fn test_shorter_snapshot_zeroes_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = SharedMemorySink::new(dir.path(), 16);
        sink.open("region_c").expect("open");

        sink.write(&encoded(&[1, 2, 3, 4])).expect("write long");
        sink.write(&encoded(&[9])).expect("write short");

        let values = read_snapshot(dir.path(), "region_c", None).expect("read");
        assert_eq!(values, vec![9, 0, 0, 0]);
    }

    #[test]
    fn test_oversize_write_rejected_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = SharedMemorySink::new(dir.path(), 8);
        sink.open("region_d").expect("open");
        sink.write(&encoded(&[7, 8])).expect("fits");

        let err = sink.write(&encoded(&[1, 2, 3])).unwrap_err();
        assert!(matches!(
            err,
            SinkError::Overflow {
                len: 12,
                capacity: 8
            }
        ));

        let values = read_snapshot(dir.path(), "region_d", None).expect("read");
        assert_eq!(values, vec![7, 8]);
    }

    #[test]
    fn test_open_attaches_to_existing_region() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut first = SharedMemorySink::new(dir.path(), 32);
        first.open("shared").expect("open first");
        first.write(&encoded(&[11])).expect("write");
        first.close();

        let mut second = SharedMemorySink::new(dir.path(), 32);
        second.open("shared").expect("attach");
        let values = read_snapshot(dir.path(), "shared", Some(1)).expect("read");
        assert_eq!(values, vec![11]);
    }

    #[test]
    fn test_write_before_open_fails() {
        let mut sink = SharedMemorySink::new("/nonexistent", 8);
        assert!(matches!(sink.write(&[0; 4]), Err(SinkError::NotOpen)));
    }

    #[test]
    fn test_open_missing_dir_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = SharedMemorySink::new(dir.path().join("missing"), 8);
        assert!(matches!(sink.open("x"), Err(SinkError::Open { .. })));
        assert!(!sink.is_open());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut sink = SharedMemorySink::default();
        sink.close();
        sink.close();
        assert!(!sink.is_open());
        assert_eq!(sink.capacity(), DEFAULT_SHM_CAPACITY);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = SharedMemorySink::new(dir.path(), 8);
        assert!(matches!(
            sink.open("a/b"),
            Err(SinkError::InvalidName(_))
        ));
    }
}
