use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};

use super::{
    memento::{MementoLog, TileChanges},
    Payload, Tile, TileCoord, TileData, TileError, TileReadGuard, TileWriteGuard,
};
use crate::swap::{SwapError, Swapper};

/// Counts for logging and tests.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub tiles: usize,
    pub swapped_out: usize,
    pub lost: usize,
}

/// Payload of coordinates holding no tile. Never swapped.
struct DefaultTile {
    data: Arc<TileData>,
    payload: Arc<Payload>,
}
impl DefaultTile {
    fn new(tile_size: u32, pixel: &[u8]) -> Self {
        let data = Arc::new(TileData::filled(tile_size, pixel));
        Self {
            payload: Payload::shared(data.clone(), None, 0),
            data,
        }
    }
}

/// Sparse grid of copy-on-write tiles. Coordinates never written read as the default payload,
/// which all such tiles share.
pub struct TileStore {
    tile_size: u32,
    pixel_size: usize,
    tiles: RwLock<HashMap<TileCoord, Arc<Tile>>>,
    default: RwLock<DefaultTile>,
    /// Monotonic access counter, the store's notion of time for swapping.
    clock: AtomicU64,
    swap: Option<Arc<Swapper>>,
    mementos: Mutex<Vec<Weak<MementoLog>>>,
    /// Payloads handed to undo history, which may outlive their place in a tile.
    history: Mutex<Vec<Weak<Payload>>>,
}
impl TileStore {
    #[must_use]
    pub fn new(tile_size: u32, default_pixel: &[u8], swap: Option<Arc<Swapper>>) -> Self {
        Self {
            tile_size,
            pixel_size: default_pixel.len(),
            tiles: RwLock::new(HashMap::new()),
            default: RwLock::new(DefaultTile::new(tile_size, default_pixel)),
            clock: AtomicU64::new(0),
            swap,
            mementos: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
        }
    }
    #[must_use]
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }
    #[must_use]
    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }
    #[must_use]
    pub fn swapper(&self) -> Option<&Arc<Swapper>> {
        self.swap.as_ref()
    }
    /// Pixels returned for coordinates holding no tile.
    #[must_use]
    pub fn default_data(&self) -> Arc<TileData> {
        self.default.read().data.clone()
    }
    /// Change the default pixel. Tiles that already exist keep their content.
    pub fn set_default_pixel(&self, pixel: &[u8]) {
        debug_assert_eq!(pixel.len(), self.pixel_size);
        *self.default.write() = DefaultTile::new(self.tile_size, pixel);
    }
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
    #[must_use]
    pub fn contains(&self, coord: TileCoord) -> bool {
        self.tiles.read().contains_key(&coord)
    }
    /// Sorted coordinates of every existing tile.
    #[must_use]
    pub fn coords(&self) -> Vec<TileCoord> {
        let mut coords: Vec<_> = self.tiles.read().keys().copied().collect();
        coords.sort_unstable();
        coords
    }
    #[must_use]
    pub fn tile(&self, coord: TileCoord) -> Option<Arc<Tile>> {
        self.tiles.read().get(&coord).cloned()
    }
    /// Read-locked view of a tile. Missing tiles read as the default payload without being created.
    pub fn read(&self, coord: TileCoord) -> Result<TileReadGuard, TileError> {
        let tick = self.tick();
        let data = match self.tile(coord) {
            Some(tile) => tile.data(tick)?,
            None => self.default_data(),
        };
        Ok(TileReadGuard { coord, data })
    }
    /// Write-locked view of a tile, creating it from the default payload if missing.
    pub fn write(&self, coord: TileCoord) -> Result<TileWriteGuard, TileError> {
        let tick = self.tick();
        let (tile, created) = self.get_or_create(coord);
        let data = tile.lock_for_write(|previous| {
            self.record_write(coord, (!created).then(|| previous.clone()));
        })?;
        Ok(TileWriteGuard {
            tile,
            data: Some(data),
            tick,
        })
    }
    fn get_or_create(&self, coord: TileCoord) -> (Arc<Tile>, bool) {
        if let Some(tile) = self.tiles.read().get(&coord) {
            return (tile.clone(), false);
        }
        let mut tiles = self.tiles.write();
        let mut created = false;
        let tile = tiles
            .entry(coord)
            .or_insert_with(|| {
                created = true;
                let payload = self.default.read().payload.clone();
                Arc::new(Tile::new(coord, payload, self.swap.clone()))
            })
            .clone();
        (tile, created)
    }
    /// Drop every tile. Open mementos capture the old payloads first.
    pub fn clear(&self) {
        let old = std::mem::take(&mut *self.tiles.write());
        if self.has_mementos() {
            for (coord, tile) in old {
                self.record_write(coord, Some(tile.payload()));
            }
        }
    }
    /// Put a payload back, or remove the tile for `None`. Used by undo.
    pub(crate) fn restore(&self, coord: TileCoord, payload: Option<&Arc<Payload>>) {
        match payload {
            Some(payload) => {
                payload.touch(self.tick());
                let (tile, _) = self.get_or_create(coord);
                tile.install(payload.clone());
            }
            None => {
                self.tiles.write().remove(&coord);
            }
        }
    }
    pub(crate) fn apply_changes(&self, changes: &TileChanges, undo: bool) {
        let side = if undo { &changes.before } else { &changes.after };
        for (coord, payload) in side {
            self.restore(*coord, payload.as_ref());
        }
    }
    fn has_mementos(&self) -> bool {
        !self.mementos.lock().is_empty()
    }
    fn record_write(&self, coord: TileCoord, previous: Option<Arc<Payload>>) {
        let mementos = self.mementos.lock();
        for memento in mementos.iter().filter_map(Weak::upgrade) {
            memento.record(coord, previous.clone());
        }
    }
    /// Start recording pre-write payloads.
    pub(crate) fn begin_memento(&self) -> Arc<MementoLog> {
        let log = Arc::new(MementoLog::default());
        let mut mementos = self.mementos.lock();
        mementos.retain(|weak| weak.strong_count() > 0);
        mementos.push(Arc::downgrade(&log));
        log
    }
    /// Stop recording, pairing each recorded payload with the current one.
    pub(crate) fn end_memento(&self, log: &Arc<MementoLog>) -> TileChanges {
        self.mementos
            .lock()
            .retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), Arc::as_ptr(log)));
        let before = log.take();
        let after: HashMap<_, _> = before
            .keys()
            .map(|coord| (*coord, self.tile(*coord).map(|tile| tile.payload())))
            .collect();
        {
            let mut history = self.history.lock();
            history.retain(|weak| weak.strong_count() > 0);
            history.extend(
                before
                    .values()
                    .chain(after.values())
                    .flatten()
                    .map(Arc::downgrade),
            );
        }
        TileChanges { before, after }
    }
    /// Stop recording and discard what was recorded.
    pub(crate) fn abandon_memento(&self, log: &Arc<MementoLog>) {
        self.mementos
            .lock()
            .retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), Arc::as_ptr(log)));
        drop(log.take());
    }
    /// Swap out payloads, of tiles and of undo history, not accessed within the last `window`
    /// store accesses. Returns how many were swapped. A store without a swapper does nothing.
    ///
    /// Every candidate is tried even if some fail. Failed payloads stay resident, and the first
    /// error is returned.
    pub fn swap_out_cold(&self, window: u64) -> Result<usize, SwapError> {
        let now = self.clock.load(Ordering::Relaxed);
        self.swap_out_where(|payload| now.saturating_sub(payload.last_access()) >= window)
    }
    /// Swap out every eligible payload regardless of access time.
    pub fn force_swap_out(&self) -> Result<usize, SwapError> {
        self.swap_out_where(|_| true)
    }
    fn swap_out_where(&self, pred: impl Fn(&Payload) -> bool) -> Result<usize, SwapError> {
        if self.swap.is_none() {
            return Ok(0);
        }
        let mut candidates: Vec<_> = self
            .tiles
            .read()
            .values()
            .filter_map(|tile| tile.stable_payload())
            .collect();
        {
            let mut history = self.history.lock();
            history.retain(|weak| weak.strong_count() > 0);
            candidates.extend(history.iter().filter_map(Weak::upgrade));
        }
        let mut seen = HashSet::with_capacity(candidates.len());
        let (mut count, mut failed) = (0, 0);
        let mut first_err = None;
        for payload in candidates {
            if !seen.insert(Arc::as_ptr(&payload)) || !pred(payload.as_ref()) {
                continue;
            }
            match payload.swap_out() {
                Ok(true) => count += 1,
                Ok(false) => (),
                Err(err) => {
                    log::warn!("swap-out failed, tile stays in memory: {err}");
                    failed += 1;
                    first_err.get_or_insert(err);
                }
            }
        }
        if count > 0 || failed > 0 {
            log::trace!("swapped out {count} payloads, {failed} failed");
        }
        first_err.map_or(Ok(count), Err)
    }
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let tiles = self.tiles.read();
        let mut stats = StoreStats {
            tiles: tiles.len(),
            ..Default::default()
        };
        for tile in tiles.values() {
            if tile.is_swapped_out() {
                stats.swapped_out += 1;
            } else if tile.is_lost() {
                stats.lost += 1;
            }
        }
        stats
    }
}
impl std::fmt::Debug for TileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileStore")
            .field("tile_size", &self.tile_size)
            .field("pixel_size", &self.pixel_size)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::TileStore;
    use crate::{
        swap::{MemorySwap, RleCodec, SwapBackend, SwapError, SwapSlot, Swapper},
        tiles::TileCoord,
    };

    fn swapping_store() -> TileStore {
        let swap = Swapper::new(Box::new(RleCodec), Box::new(MemorySwap::default()));
        TileStore::new(64, &[0; 4], Some(Arc::new(swap)))
    }

    #[test]
    fn missing_tiles_read_default() {
        let store = TileStore::new(64, &[1, 2, 3, 4], None);
        let tile = store.read(TileCoord::new(5, -3)).unwrap();
        assert!(tile.is_filled_with(&[1, 2, 3, 4]));
        assert!(!store.contains(TileCoord::new(5, -3)));
    }
    #[test]
    fn write_then_read() {
        let store = TileStore::new(64, &[0; 4], None);
        store.write(TileCoord::new(0, 0)).unwrap().pixel_mut(10, 10).copy_from_slice(&[0xFF, 0, 0, 0xFF]);
        let tile = store.read(TileCoord::new(0, 0)).unwrap();
        assert_eq!(tile.pixel(10, 10), &[0xFF, 0, 0, 0xFF]);
        // The shared default payload is never written through.
        assert!(store.default_data().is_filled_with(&[0; 4]));
    }
    #[test]
    fn readers_keep_snapshot() {
        let store = TileStore::new(8, &[0], None);
        let coord = TileCoord::new(0, 0);
        store.write(coord).unwrap().fill(&[1]);
        let before = store.read(coord).unwrap();
        store.write(coord).unwrap().fill(&[2]);
        assert!(before.is_filled_with(&[1]));
        assert!(store.read(coord).unwrap().is_filled_with(&[2]));
    }
    #[test]
    fn concurrent_writers_different_tiles() {
        let store = Arc::new(TileStore::new(16, &[0], None));
        let handles: Vec<_> = (0..8)
            .map(|col| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for value in 0..50u8 {
                        store.write(TileCoord::new(col, 0)).unwrap().fill(&[value]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for col in 0..8 {
            assert!(store.read(TileCoord::new(col, 0)).unwrap().is_filled_with(&[49]));
        }
    }
    #[test]
    fn swap_round_trip() {
        let store = swapping_store();
        let coord = TileCoord::new(0, 0);
        store.write(coord).unwrap().pixel_mut(10, 10).copy_from_slice(&[0xFF, 0, 0, 0]);
        assert_eq!(store.force_swap_out().unwrap(), 1);
        assert_eq!(store.stats().swapped_out, 1);
        assert_eq!(store.read(coord).unwrap().pixel(10, 10), &[0xFF, 0, 0, 0]);
        assert_eq!(store.stats().swapped_out, 0);
    }
    #[test]
    fn shared_payloads_stay_resident() {
        let store = swapping_store();
        let coord = TileCoord::new(0, 0);
        store.write(coord).unwrap().fill(&[9; 4]);
        let held = store.read(coord).unwrap();
        assert_eq!(store.force_swap_out().unwrap(), 0);
        drop(held);
        assert_eq!(store.force_swap_out().unwrap(), 1);
    }
    #[test]
    fn cold_window() {
        let store = swapping_store();
        let (hot, cold) = (TileCoord::new(0, 0), TileCoord::new(1, 0));
        store.write(cold).unwrap().fill(&[1; 4]);
        store.write(hot).unwrap().fill(&[2; 4]);
        for _ in 0..10 {
            let _ = store.read(hot).unwrap();
        }
        assert_eq!(store.swap_out_cold(5).unwrap(), 1);
        assert!(store.tile(cold).unwrap().is_swapped_out());
        assert!(!store.tile(hot).unwrap().is_swapped_out());
    }
    #[test]
    fn memento_captures_first_write() {
        let store = TileStore::new(8, &[0], None);
        let (old, new) = (TileCoord::new(0, 0), TileCoord::new(3, 3));
        store.write(old).unwrap().fill(&[1]);
        let memento = store.begin_memento();
        store.write(old).unwrap().fill(&[2]);
        store.write(old).unwrap().fill(&[3]);
        store.write(new).unwrap().fill(&[4]);
        let changes = store.end_memento(&memento);
        assert_eq!(changes.len(), 2);

        store.apply_changes(&changes, true);
        assert!(store.read(old).unwrap().is_filled_with(&[1]));
        assert!(!store.contains(new));

        store.apply_changes(&changes, false);
        assert!(store.read(old).unwrap().is_filled_with(&[3]));
        assert!(store.read(new).unwrap().is_filled_with(&[4]));
    }
    #[test]
    fn history_payloads_swap_too() {
        let store = swapping_store();
        let coord = TileCoord::new(0, 0);
        store.write(coord).unwrap().fill(&[1; 4]);
        let memento = store.begin_memento();
        store.write(coord).unwrap().fill(&[2; 4]);
        let changes = store.end_memento(&memento);

        // Both the shown payload and the one only history keeps.
        assert_eq!(store.force_swap_out().unwrap(), 2);
        assert_eq!(store.swapper().unwrap().swapped_out(), 2);
        assert!(store.tile(coord).unwrap().is_swapped_out());

        store.apply_changes(&changes, true);
        assert!(store.read(coord).unwrap().is_filled_with(&[1; 4]));
        store.apply_changes(&changes, false);
        assert!(store.read(coord).unwrap().is_filled_with(&[2; 4]));
        drop(changes);
        assert_eq!(store.swapper().unwrap().swapped_out(), 0);
    }
    #[test]
    fn failed_swap_out_keeps_pixels() {
        struct DiskFull {
            attempts: Arc<AtomicUsize>,
        }
        impl SwapBackend for DiskFull {
            fn store(&self, _: &[u8]) -> Result<SwapSlot, SwapError> {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                Err(SwapError::Io(std::io::Error::other("disk full")))
            }
            fn load(&self, _: &SwapSlot, _: &mut Vec<u8>) -> Result<(), SwapError> {
                unreachable!("nothing was stored")
            }
            fn release(&self, _: &SwapSlot) {}
            fn bytes_in_use(&self) -> u64 {
                0
            }
        }
        let attempts = Arc::new(AtomicUsize::new(0));
        let backend = DiskFull {
            attempts: attempts.clone(),
        };
        let swap = Swapper::new(Box::new(RleCodec), Box::new(backend));
        let store = TileStore::new(64, &[0; 4], Some(Arc::new(swap)));
        let (first, second) = (TileCoord::new(0, 0), TileCoord::new(1, 0));
        store.write(first).unwrap().pixel_mut(10, 10).copy_from_slice(&[0xFF, 0, 0, 0xFF]);
        store.write(second).unwrap().fill(&[7; 4]);

        assert!(matches!(store.force_swap_out(), Err(SwapError::Io(_))));
        // The failure on one tile doesn't stop the sweep.
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
        assert_eq!(store.stats().swapped_out, 0);
        assert_eq!(store.read(first).unwrap().pixel(10, 10), &[0xFF, 0, 0, 0xFF]);
        assert!(store.read(second).unwrap().is_filled_with(&[7; 4]));
    }
}
