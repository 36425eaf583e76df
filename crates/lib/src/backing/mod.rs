//! Backing stores: the fixed-size byte regions the entry store lives in.
//!
//! The entry store does not care where its memory comes from. Anything that
//! can hand back a zeroed, randomly addressable region whose address stays
//! put for the region's lifetime implements [`BackingStore`]. Two
//! implementations are provided:
//!
//! * [`HeapRegion`] - a plain heap allocation, private to the process.
//! * [`MmapRegion`] - anonymous or file-backed shared memory via `memmap2`.

use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap2::MmapMut;

/// A fixed-size, zero-initializable byte region.
///
/// Implementations must keep the region at a stable address for as long as
/// the value is alive: moving the owning value must not move the bytes.
pub trait BackingStore: Send + Sync + Debug {
    /// Size of the region in bytes.
    fn len(&self) -> usize;

    /// Whether the region is zero-sized.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutable view of the whole region.
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Make writes durable, where the region supports it.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Short description used in logs.
    fn kind(&self) -> &'static str;
}

/// Heap-allocated region.
#[derive(Debug)]
pub struct HeapRegion {
    bytes: Box<[u8]>,
}

impl HeapRegion {
    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len].into_boxed_slice(),
        }
    }
}

impl BackingStore for HeapRegion {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn kind(&self) -> &'static str {
        "heap"
    }
}

/// Memory-mapped region, either anonymous or backed by a file.
pub struct MmapRegion {
    map: MmapMut,
    _file: Option<File>,
}

impl MmapRegion {
    /// Map `len` bytes of anonymous memory. The kernel hands these back
    /// zeroed.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        let map = MmapMut::map_anon(len.max(1))?;
        Ok(Self { map, _file: None })
    }

    /// Map `len` bytes of the file at `path`, creating or resizing it as
    /// needed. Existing contents are zeroed: the entry store always starts
    /// from an empty arena.
    pub fn create(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let len = len.max(1);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        file.set_len(len as u64)?;

        // SAFETY: the file was just sized to `len` and stays open for the
        // lifetime of the mapping. Concurrent modification by other
        // processes is the caller's responsibility, as with any shared map.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map.fill(0);
        Ok(Self {
            map,
            _file: Some(file),
        })
    }
}

impl Debug for MmapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapRegion")
            .field("len", &self.map.len())
            .field("file_backed", &self._file.is_some())
            .finish()
    }
}

impl BackingStore for MmapRegion {
    fn len(&self) -> usize {
        self.map.len()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    fn flush(&self) -> io::Result<()> {
        if self._file.is_some() {
            self.map.flush()
        } else {
            Ok(())
        }
    }

    fn kind(&self) -> &'static str {
        if self._file.is_some() {
            "mmap-file"
        } else {
            "mmap-anon"
        }
    }
}
