use std::io::{Read, Seek, SeekFrom, Write};

use az::CheckedAs;
use parking_lot::Mutex;

use super::{SwapBackend, SwapError, SwapSlot, CHECKSUM};

/// Slots are reserved in multiples of this many bytes, so that freed slots are easier to reuse.
const GRANULE: u32 = 256;

struct Inner {
    file: std::fs::File,
    /// End of the furthest slot ever allocated.
    end: u64,
    /// Released `(offset, capacity)` pairs.
    free: Vec<(u64, u32)>,
    in_use: u64,
}

/// Swap backed by an anonymous temporary file, deleted by the OS once closed.
pub struct FileSwap {
    inner: Mutex<Inner>,
}
impl FileSwap {
    /// Create the swap file in `directory`, creating the directory if needed.
    pub fn new_in(directory: &std::path::Path) -> Result<Self, SwapError> {
        std::fs::create_dir_all(directory)?;
        let file = tempfile::tempfile_in(directory)?;
        Ok(Self::from_file(file))
    }
    /// Use an already-open, writable file. Its contents are overwritten.
    #[must_use]
    pub fn from_file(file: std::fs::File) -> Self {
        Self {
            inner: Mutex::new(Inner {
                file,
                end: 0,
                free: Vec::new(),
                in_use: 0,
            }),
        }
    }
    /// Length of the backing file.
    #[must_use]
    pub fn file_len(&self) -> u64 {
        self.inner.lock().end
    }
}
impl Inner {
    /// Best fit from the free list, else grow the file.
    fn allocate(&mut self, len: u32) -> (u64, u32) {
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, (_, capacity))| *capacity >= len)
            .min_by_key(|(_, (_, capacity))| *capacity)
            .map(|(idx, _)| idx);
        if let Some(idx) = best {
            return self.free.swap_remove(idx);
        }
        let capacity = len.div_ceil(GRANULE).max(1) * GRANULE;
        let offset = self.end;
        self.end += u64::from(capacity);
        (offset, capacity)
    }
}
impl SwapBackend for FileSwap {
    fn store(&self, bytes: &[u8]) -> Result<SwapSlot, SwapError> {
        let len: u32 = bytes.len().checked_as().ok_or(SwapError::TooLarge(bytes.len()))?;
        let mut inner = self.inner.lock();
        let (offset, capacity) = inner.allocate(len);
        let written = inner
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| inner.file.write_all(bytes));
        if let Err(err) = written {
            inner.free.push((offset, capacity));
            return Err(err.into());
        }
        inner.in_use += u64::from(len);
        Ok(SwapSlot {
            offset,
            len,
            capacity,
            checksum: CHECKSUM.checksum(bytes),
        })
    }
    fn load(&self, slot: &SwapSlot, out: &mut Vec<u8>) -> Result<(), SwapError> {
        out.resize(slot.len as usize, 0);
        {
            let mut inner = self.inner.lock();
            inner.file.seek(SeekFrom::Start(slot.offset))?;
            inner.file.read_exact(out)?;
        }
        let read = CHECKSUM.checksum(out);
        if read != slot.checksum {
            return Err(SwapError::Checksum {
                stored: slot.checksum,
                read,
            });
        }
        Ok(())
    }
    fn release(&self, slot: &SwapSlot) {
        let mut inner = self.inner.lock();
        inner.in_use = inner.in_use.saturating_sub(u64::from(slot.len));
        inner.free.push((slot.offset, slot.capacity));
    }
    fn bytes_in_use(&self) -> u64 {
        self.inner.lock().in_use
    }
}
