//! # Swap
//! Cold tiles can be compressed out of memory. A [`Swapper`] pairs a [`TileCompressor`] with a
//! [`SwapBackend`] holding the compressed bytes, and is shared by every store of an image.
//!
//! The same compressors also frame tiles for [`crate::io`] persistence.

mod codec;
mod file;
mod memory;

pub use codec::{RawCodec, RleCodec, TileCompressor};
pub use file::FileSwap;
pub use memory::MemorySwap;

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use crate::{config::CodecKind, tiles::TileData};

#[derive(thiserror::Error, Debug)]
pub enum SwapError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch, stored {stored:#010x} but read {read:#010x}")]
    Checksum { stored: u32, read: u32 },
    #[error("malformed tile stream: {0}")]
    Malformed(&'static str),
    #[error("compressed tile of {0} bytes is too large")]
    TooLarge(usize),
    #[error("no swap backend configured")]
    NoBackend,
}

/// Location of compressed bytes within a backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwapSlot {
    pub offset: u64,
    /// Bytes in use.
    pub len: u32,
    /// Bytes reserved, at least `len`.
    pub capacity: u32,
    pub checksum: u32,
}

/// Storage for compressed tile payloads.
pub trait SwapBackend: Send + Sync {
    fn store(&self, bytes: &[u8]) -> Result<SwapSlot, SwapError>;
    /// Read a slot's bytes into `out`, verifying its checksum.
    fn load(&self, slot: &SwapSlot, out: &mut Vec<u8>) -> Result<(), SwapError>;
    /// Mark a slot reusable. Releasing twice is a logic error.
    fn release(&self, slot: &SwapSlot);
    /// Bytes currently held by live slots.
    fn bytes_in_use(&self) -> u64;
}

pub(crate) const CHECKSUM: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// A payload living in swap, plus what's needed to rebuild it.
#[derive(Debug)]
pub struct SwappedTile {
    slot: SwapSlot,
    tile_size: u32,
    pixel_size: usize,
}

pub struct Swapper {
    codec: Box<dyn TileCompressor>,
    backend: Box<dyn SwapBackend>,
    swapped_out: AtomicUsize,
    total_swaps: AtomicU64,
}
impl Swapper {
    #[must_use]
    pub fn new(codec: Box<dyn TileCompressor>, backend: Box<dyn SwapBackend>) -> Self {
        Self {
            codec,
            backend,
            swapped_out: AtomicUsize::new(0),
            total_swaps: AtomicU64::new(0),
        }
    }
    /// Build the configured swapper, or `None` if swapping is disabled.
    pub fn from_config(config: &crate::config::SwapConfig) -> Result<Option<Arc<Self>>, SwapError> {
        if !config.enabled {
            return Ok(None);
        }
        let directory = config.resolve_directory();
        let backend = FileSwap::new_in(&directory)?;
        log::info!(
            "swapping cold tiles to {} with {} codec",
            directory.display(),
            config.codec
        );
        Ok(Some(Arc::new(Self::new(codec_for(config.codec), Box::new(backend)))))
    }
    #[must_use]
    pub fn codec(&self) -> &dyn TileCompressor {
        &*self.codec
    }
    pub fn swap_out(&self, data: &TileData) -> Result<SwappedTile, SwapError> {
        let mut buffer = vec![0; self.codec.tile_data_buffer_size(data)];
        let len = self.codec.compress_tile_data(data, &mut buffer)?;
        let slot = self.backend.store(&buffer[..len])?;
        self.swapped_out.fetch_add(1, Ordering::Relaxed);
        self.total_swaps.fetch_add(1, Ordering::Relaxed);
        Ok(SwappedTile {
            slot,
            tile_size: data.tile_size(),
            pixel_size: data.pixel_size(),
        })
    }
    pub fn swap_in(&self, swapped: &SwappedTile) -> Result<TileData, SwapError> {
        let mut buffer = Vec::with_capacity(swapped.slot.len as usize);
        self.backend.load(&swapped.slot, &mut buffer)?;
        let mut data = TileData::zeroed(swapped.tile_size, swapped.pixel_size);
        self.codec.decompress_tile_data(&buffer, &mut data)?;
        Ok(data)
    }
    pub fn release(&self, swapped: SwappedTile) {
        self.backend.release(&swapped.slot);
        self.swapped_out.fetch_sub(1, Ordering::Relaxed);
    }
    /// Payloads currently in swap.
    #[must_use]
    pub fn swapped_out(&self) -> usize {
        self.swapped_out.load(Ordering::Relaxed)
    }
    #[must_use]
    pub fn bytes_in_use(&self) -> u64 {
        self.backend.bytes_in_use()
    }
    /// Summary for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{} tiles in swap ({}), {} swap-outs total",
            self.swapped_out(),
            human_bytes::human_bytes(self.bytes_in_use() as f64),
            self.total_swaps.load(Ordering::Relaxed),
        )
    }
}
impl std::fmt::Debug for Swapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapper")
            .field("codec", &self.codec.name())
            .field("swapped_out", &self.swapped_out())
            .finish_non_exhaustive()
    }
}

#[must_use]
pub fn codec_for(kind: CodecKind) -> Box<dyn TileCompressor> {
    match kind {
        CodecKind::Raw => Box::new(RawCodec),
        CodecKind::Rle => Box::new(RleCodec),
    }
}
