//! # Paint devices
//! A [`PaintDevice`] is a tile store placed in the image: pixel accessors take image coordinates,
//! which are shifted by the device offset before reaching the store. Changes made inside a
//! [`Transaction`] can be turned into a [`TileCommand`] for the undo stack.
//!
//! Once a tile of a device is lost to a failed swap-in, the whole device latches into a failed
//! state and every further access reports [`DeviceError::Lost`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    config::TileConfig,
    id::UniqueId,
    lod::PlanarOffset,
    swap::{SwapError, Swapper},
    tiles::{MementoLog, StoreStats, TileChanges, TileCoord, TileError, TileStore},
    undo::{DoUndo, UndoCommand, UndoError},
    util::{Point, Rect},
};

pub type DeviceId = UniqueId<PaintDevice>;
/// One pixel, inline for every common pixel size.
pub type Pixel = SmallVec<[u8; 8]>;

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("{0} lost pixel data in a failed swap-in")]
    Lost(DeviceId),
    #[error("pixel of {got} bytes given to a device with {expected} byte pixels")]
    PixelSize { expected: usize, got: usize },
    #[error("buffer of {got} bytes given for {rect:?}, expected {expected}")]
    BufferSize { rect: Rect, expected: usize, got: usize },
    #[error("invalid device geometry: {0}")]
    Geometry(&'static str),
    #[error(transparent)]
    Swap(#[from] SwapError),
}

pub struct PaintDevice {
    id: DeviceId,
    store: TileStore,
    offset: Mutex<PlanarOffset>,
    failed: AtomicBool,
}
impl PaintDevice {
    pub fn new(tile_size: u32, default_pixel: &[u8], swap: Option<Arc<Swapper>>) -> Result<Self, DeviceError> {
        if !TileConfig::is_valid_size(tile_size) {
            return Err(DeviceError::Geometry("tile size must be a power of two between 8 and 1024"));
        }
        if default_pixel.is_empty() {
            return Err(DeviceError::Geometry("pixels must be at least one byte"));
        }
        Ok(Self {
            id: DeviceId::new(),
            store: TileStore::new(tile_size, default_pixel, swap),
            offset: Mutex::new(PlanarOffset::default()),
            failed: AtomicBool::new(false),
        })
    }
    /// Empty device with the same geometry, default pixel and swap as `other`, at the origin.
    #[must_use]
    pub fn new_like(other: &Self) -> Self {
        let default = other.store.default_data();
        let pixel = default.pixel(0, 0);
        Self {
            id: DeviceId::new(),
            store: TileStore::new(other.tile_size(), pixel, other.store.swapper().cloned()),
            offset: Mutex::new(PlanarOffset::default()),
            failed: AtomicBool::new(false),
        }
    }
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }
    #[must_use]
    pub fn store(&self) -> &TileStore {
        &self.store
    }
    #[must_use]
    pub fn tile_size(&self) -> u32 {
        self.store.tile_size()
    }
    #[must_use]
    pub fn pixel_size(&self) -> usize {
        self.store.pixel_size()
    }
    #[must_use]
    pub fn default_pixel(&self) -> Pixel {
        Pixel::from_slice(self.store.default_data().pixel(0, 0))
    }
    pub fn set_default_pixel(&self, pixel: &[u8]) -> Result<(), DeviceError> {
        self.check_pixel(pixel)?;
        self.store.set_default_pixel(pixel);
        Ok(())
    }
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn offset(&self) -> Point {
        self.offset.lock().get(0)
    }
    #[must_use]
    pub fn x(&self) -> i32 {
        self.offset().x
    }
    #[must_use]
    pub fn y(&self) -> i32 {
        self.offset().y
    }
    pub fn set_offset(&self, offset: Point) {
        self.offset.lock().set(0, offset);
    }
    #[must_use]
    pub fn offset_at(&self, level: u32) -> Point {
        self.offset.lock().get(level)
    }
    pub fn set_offset_at(&self, level: u32, offset: Point) {
        self.offset.lock().set(level, offset);
    }
    pub fn sync_lod_plane(&self, level: u32) {
        self.offset.lock().sync(level);
    }

    fn ensure_usable(&self) -> Result<(), DeviceError> {
        if self.is_failed() {
            Err(DeviceError::Lost(self.id))
        } else {
            Ok(())
        }
    }
    /// Map store errors, latching the device on data loss.
    fn checked<T>(&self, result: Result<T, TileError>) -> Result<T, DeviceError> {
        result.map_err(|err| match err {
            TileError::Lost(_) | TileError::Swap(_) => {
                if !self.failed.swap(true, Ordering::AcqRel) {
                    log::error!("{} failed: {err}", self.id);
                }
                DeviceError::Lost(self.id)
            }
            TileError::SizeMismatch { expected, got } => DeviceError::PixelSize { expected, got },
        })
    }
    fn check_pixel(&self, pixel: &[u8]) -> Result<(), DeviceError> {
        if pixel.len() == self.pixel_size() {
            Ok(())
        } else {
            Err(DeviceError::PixelSize {
                expected: self.pixel_size(),
                got: pixel.len(),
            })
        }
    }
    /// Image rect to store-local rect.
    fn to_local(&self, rect: Rect) -> Rect {
        rect.translated(-self.offset())
    }
    /// Tiles touched by a store-local rect, with the part of the rect inside each.
    fn parts(&self, local: Rect) -> impl Iterator<Item = (TileCoord, Rect)> + '_ {
        let size = self.tile_size();
        TileCoord::covering(local, size).map(move |coord| (coord, coord.rect(size).intersect(&local)))
    }

    /// Pixel at image coordinates.
    pub fn pixel(&self, x: i32, y: i32) -> Result<Pixel, DeviceError> {
        let mut pixel = Pixel::from_elem(0, self.pixel_size());
        self.read_pixel(x, y, &mut pixel)?;
        Ok(pixel)
    }
    pub fn read_pixel(&self, x: i32, y: i32, out: &mut [u8]) -> Result<(), DeviceError> {
        self.ensure_usable()?;
        self.check_pixel(out)?;
        let local = Point::new(x, y) - self.offset();
        let size = self.tile_size();
        let coord = TileCoord::containing(local.x, local.y, size);
        let tile = self.checked(self.store.read(coord))?;
        let origin = coord.rect(size).top_left();
        out.copy_from_slice(tile.pixel((local.x - origin.x) as u32, (local.y - origin.y) as u32));
        Ok(())
    }
    pub fn write_pixel(&self, x: i32, y: i32, pixel: &[u8]) -> Result<(), DeviceError> {
        self.fill_rect(Rect::new(x, y, 1, 1), pixel)
    }
    pub fn fill_rect(&self, rect: Rect, pixel: &[u8]) -> Result<(), DeviceError> {
        self.ensure_usable()?;
        self.check_pixel(pixel)?;
        let size = self.tile_size();
        for (coord, part) in self.parts(self.to_local(rect)) {
            let mut tile = self.checked(self.store.write(coord))?;
            let tile_rect = coord.rect(size);
            if part == tile_rect {
                tile.fill(pixel);
                continue;
            }
            for row in part.top()..part.bottom() {
                let span = tile.span_mut(
                    (part.left() - tile_rect.left()) as u32,
                    (row - tile_rect.top()) as u32,
                    part.width as u32,
                );
                for dst in span.chunks_exact_mut(pixel.len()) {
                    dst.copy_from_slice(pixel);
                }
            }
        }
        Ok(())
    }
    /// Row-major copy of the pixels of an image rect.
    pub fn read_rect(&self, rect: Rect) -> Result<Vec<u8>, DeviceError> {
        self.ensure_usable()?;
        let pixel_size = self.pixel_size();
        let mut out = vec![0; rect.area() * pixel_size];
        let local = self.to_local(rect);
        let size = self.tile_size();
        for (coord, part) in self.parts(local) {
            let tile = self.checked(self.store.read(coord))?;
            let tile_rect = coord.rect(size);
            for row in part.top()..part.bottom() {
                let span = tile.span(
                    (part.left() - tile_rect.left()) as u32,
                    (row - tile_rect.top()) as u32,
                    part.width as u32,
                );
                let start = ((row - local.top()) as usize * local.width as usize
                    + (part.left() - local.left()) as usize)
                    * pixel_size;
                out[start..start + span.len()].copy_from_slice(span);
            }
        }
        Ok(out)
    }
    /// Overwrite an image rect from row-major bytes.
    pub fn write_rect(&self, rect: Rect, bytes: &[u8]) -> Result<(), DeviceError> {
        self.ensure_usable()?;
        let pixel_size = self.pixel_size();
        let expected = rect.area() * pixel_size;
        if bytes.len() != expected {
            return Err(DeviceError::BufferSize {
                rect,
                expected,
                got: bytes.len(),
            });
        }
        let local = self.to_local(rect);
        let size = self.tile_size();
        for (coord, part) in self.parts(local) {
            let mut tile = self.checked(self.store.write(coord))?;
            let tile_rect = coord.rect(size);
            for row in part.top()..part.bottom() {
                let span = tile.span_mut(
                    (part.left() - tile_rect.left()) as u32,
                    (row - tile_rect.top()) as u32,
                    part.width as u32,
                );
                let start = ((row - local.top()) as usize * local.width as usize
                    + (part.left() - local.left()) as usize)
                    * pixel_size;
                span.copy_from_slice(&bytes[start..start + span.len()]);
            }
        }
        Ok(())
    }
    /// Run `process` over every pixel of an image rect, one tile at a time, with the pixel's
    /// image coordinates. Stops early, without error, once `should_stop` returns true.
    pub fn process_rect(
        &self,
        rect: Rect,
        should_stop: impl Fn() -> bool,
        mut process: impl FnMut(i32, i32, &mut [u8]),
    ) -> Result<(), DeviceError> {
        self.ensure_usable()?;
        let offset = self.offset();
        let pixel_size = self.pixel_size();
        let size = self.tile_size();
        for (coord, part) in self.parts(self.to_local(rect)) {
            if should_stop() {
                return Ok(());
            }
            let mut tile = self.checked(self.store.write(coord))?;
            let tile_rect = coord.rect(size);
            for row in part.top()..part.bottom() {
                let span = tile.span_mut(
                    (part.left() - tile_rect.left()) as u32,
                    (row - tile_rect.top()) as u32,
                    part.width as u32,
                );
                for (col, pixel) in (part.left()..).zip(span.chunks_exact_mut(pixel_size)) {
                    process(col + offset.x, row + offset.y, pixel);
                }
            }
        }
        Ok(())
    }
    /// Drop all content.
    pub fn clear(&self) -> Result<(), DeviceError> {
        self.ensure_usable()?;
        self.store.clear();
        Ok(())
    }
    pub fn clear_rect(&self, rect: Rect) -> Result<(), DeviceError> {
        self.fill_rect(rect, &self.default_pixel())
    }
    /// Image area covered by existing tiles.
    #[must_use]
    pub fn extent(&self) -> Rect {
        let size = self.tile_size();
        let offset = self.offset();
        self.store
            .coords()
            .into_iter()
            .fold(Rect::EMPTY, |acc, coord| acc | coord.rect(size).translated(offset))
    }
    /// Smallest image rect containing every pixel that differs from the default pixel.
    pub fn exact_bounds(&self) -> Result<Rect, DeviceError> {
        self.ensure_usable()?;
        let default = self.default_pixel();
        let size = self.tile_size();
        let mut bounds = Rect::EMPTY;
        for coord in self.store.coords() {
            let tile = self.checked(self.store.read(coord))?;
            if tile.is_filled_with(&default) {
                continue;
            }
            let origin = coord.rect(size).top_left();
            let mut tile_bounds: Option<(u32, u32, u32, u32)> = None;
            for y in 0..size {
                for x in 0..size {
                    if tile.pixel(x, y) != default.as_slice() {
                        tile_bounds = Some(match tile_bounds {
                            None => (x, y, x, y),
                            Some((l, t, r, b)) => (l.min(x), t.min(y), r.max(x), b.max(y)),
                        });
                    }
                }
            }
            if let Some((l, t, r, b)) = tile_bounds {
                bounds |= Rect::from_edges(
                    origin.x + l as i32,
                    origin.y + t as i32,
                    origin.x + r as i32 + 1,
                    origin.y + b as i32 + 1,
                );
            }
        }
        Ok(bounds.translated(self.offset()))
    }
    /// Hash of offset, default pixel and every tile not equal to the default.
    /// Equal hashes mean equal visible content.
    pub fn content_hash(&self) -> Result<blake3::Hash, DeviceError> {
        self.ensure_usable()?;
        let default = self.default_pixel();
        let offset = self.offset();
        let mut hasher = blake3::Hasher::new();
        hasher.update(&offset.x.to_le_bytes());
        hasher.update(&offset.y.to_le_bytes());
        hasher.update(&default);
        for coord in self.store.coords() {
            let tile = self.checked(self.store.read(coord))?;
            if tile.is_filled_with(&default) {
                continue;
            }
            hasher.update(&coord.col.to_le_bytes());
            hasher.update(&coord.row.to_le_bytes());
            hasher.update(tile.bytes());
        }
        Ok(hasher.finalize())
    }

    /// Composite `source` onto this device at the source's own offset.
    pub fn merge_from(&self, source: &Self, opacity: u8) -> Result<(), DeviceError> {
        if source.pixel_size() != self.pixel_size() {
            return Err(DeviceError::PixelSize {
                expected: self.pixel_size(),
                got: source.pixel_size(),
            });
        }
        let pixel_size = self.pixel_size();
        let source_default = source.default_pixel();
        for coord in source.store.coords() {
            let rect = coord.rect(source.tile_size()).translated(source.offset());
            let src = source.read_rect(rect)?;
            let mut dst = self.read_rect(rect)?;
            let mut touched = false;
            for (dst, src) in dst.chunks_exact_mut(pixel_size).zip(src.chunks_exact(pixel_size)) {
                if src != source_default.as_slice() {
                    crate::compose::over(dst, src, opacity);
                    touched = true;
                }
            }
            if touched {
                self.write_rect(rect, &dst)?;
            }
        }
        Ok(())
    }
    /// Copy pixels of `source` where `mask` is set, within an image rect.
    pub fn copy_masked_from(&self, source: &Self, mask: &Self, rect: Rect) -> Result<(), DeviceError> {
        let pixel_size = self.pixel_size();
        let src = source.read_rect(rect)?;
        let coverage = mask.read_rect(rect)?;
        let mut dst = self.read_rect(rect)?;
        for ((dst, src), coverage) in dst
            .chunks_exact_mut(pixel_size)
            .zip(src.chunks_exact(pixel_size))
            .zip(coverage.chunks_exact(mask.pixel_size()))
        {
            if coverage[0] != 0 {
                dst.copy_from_slice(src);
            }
        }
        self.write_rect(rect, &dst)
    }
    /// Reset pixels to the default where `mask` is set, within an image rect.
    pub fn clear_masked(&self, mask: &Self, rect: Rect) -> Result<(), DeviceError> {
        let default = self.default_pixel();
        let coverage = mask.read_rect(rect)?;
        let mut dst = self.read_rect(rect)?;
        for (dst, coverage) in dst
            .chunks_exact_mut(self.pixel_size())
            .zip(coverage.chunks_exact(mask.pixel_size()))
        {
            if coverage[0] != 0 {
                dst.copy_from_slice(&default);
            }
        }
        self.write_rect(rect, &dst)
    }

    /// Start recording changes for undo.
    #[must_use]
    pub fn transaction(self: &Arc<Self>, text: impl Into<String>) -> Transaction {
        Transaction {
            device: self.clone(),
            log: Some(self.store.begin_memento()),
            text: text.into(),
        }
    }
    pub fn swap_out_cold(&self, window: u64) -> Result<usize, DeviceError> {
        Ok(self.store.swap_out_cold(window)?)
    }
    pub fn force_swap_out(&self) -> Result<usize, DeviceError> {
        Ok(self.store.force_swap_out()?)
    }
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }
}
impl std::fmt::Debug for PaintDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaintDevice")
            .field("id", &self.id)
            .field("offset", &self.offset())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Records every tile written on a device until committed or reverted.
/// Dropping it does neither: changes stay, but can no longer be undone.
pub struct Transaction {
    device: Arc<PaintDevice>,
    log: Option<Arc<MementoLog>>,
    text: String,
}
impl Transaction {
    #[must_use]
    pub fn device(&self) -> &Arc<PaintDevice> {
        &self.device
    }
    fn finish(&mut self) -> TileChanges {
        match self.log.take() {
            Some(log) => self.device.store.end_memento(&log),
            None => TileChanges::default(),
        }
    }
    /// Stop recording and package the changes as an undo command.
    pub fn commit(mut self) -> Result<TileCommand, DeviceError> {
        let changes = self.finish();
        log::trace!("{}: committed {} tiles", self.text, changes.len());
        Ok(TileCommand {
            device: self.device.clone(),
            changes,
            text: std::mem::take(&mut self.text),
        })
    }
    /// Stop recording and put every recorded tile back as it was.
    pub fn revert(mut self) -> Result<Rect, DeviceError> {
        let changes = self.finish();
        self.device.store.apply_changes(&changes, true);
        log::trace!("{}: reverted {} tiles", self.text, changes.len());
        Ok(changes_rect(&self.device, &changes))
    }
}
impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(log) = self.log.take() {
            log::debug!("{}: dropped without commit", self.text);
            self.device.store.abandon_memento(&log);
        }
    }
}

fn changes_rect(device: &PaintDevice, changes: &TileChanges) -> Rect {
    let size = device.tile_size();
    let offset = device.offset();
    changes
        .coords()
        .fold(Rect::EMPTY, |acc, coord| acc | coord.rect(size).translated(offset))
}

/// Undoable tile changes of one device.
pub struct TileCommand {
    device: Arc<PaintDevice>,
    changes: TileChanges,
    text: String,
}
impl TileCommand {
    #[must_use]
    pub fn device(&self) -> &Arc<PaintDevice> {
        &self.device
    }
    /// Image area of the changed tiles, at the device's current offset.
    #[must_use]
    pub fn dirty_rect(&self) -> Rect {
        changes_rect(&self.device, &self.changes)
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
impl UndoCommand for TileCommand {
    fn text(&self) -> &str {
        &self.text
    }
    fn apply(&self, direction: DoUndo) -> Result<(), UndoError> {
        self.device.ensure_usable()?;
        self.device
            .store
            .apply_changes(&self.changes, direction == DoUndo::Undo);
        Ok(())
    }
    fn can_merge_with(&self, later: &dyn UndoCommand) -> bool {
        later
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|later| Arc::ptr_eq(&self.device, &later.device))
    }
    fn merge_with(&mut self, later: &dyn UndoCommand) -> bool {
        match later.as_any().downcast_ref::<Self>() {
            Some(later) if Arc::ptr_eq(&self.device, &later.device) => {
                self.changes.absorb(&later.changes);
                true
            }
            _ => false,
        }
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
impl std::fmt::Debug for TileCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCommand")
            .field("device", &self.device.id)
            .field("text", &self.text)
            .field("changes", &self.changes)
            .finish()
    }
}
