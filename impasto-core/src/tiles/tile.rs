use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{Payload, TileCoord, TileData, TileError};
use crate::swap::Swapper;

enum TileState {
    /// Readable.
    Stable(Arc<Payload>),
    /// A writer holds the pixels. If the writer had to copy, readers keep seeing the
    /// previous payload until the write is published.
    Writing(Option<Arc<Payload>>),
}

/// One cell of a [`super::TileStore`].
pub struct Tile {
    coord: TileCoord,
    state: Mutex<TileState>,
    changed: Condvar,
    swap: Option<Arc<Swapper>>,
}
impl Tile {
    pub(super) fn new(coord: TileCoord, payload: Arc<Payload>, swap: Option<Arc<Swapper>>) -> Self {
        Self {
            coord,
            state: Mutex::new(TileState::Stable(payload)),
            changed: Condvar::new(),
            swap,
        }
    }
    #[must_use]
    pub fn coord(&self) -> TileCoord {
        self.coord
    }
    #[must_use]
    pub fn is_swapped_out(&self) -> bool {
        self.stable_payload().is_some_and(|payload| payload.is_swapped_out())
    }
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.stable_payload().is_some_and(|payload| payload.is_lost())
    }
    /// Payload if no write is in progress.
    pub(super) fn stable_payload(&self) -> Option<Arc<Payload>> {
        match &*self.state.lock() {
            TileState::Stable(payload) => Some(payload.clone()),
            TileState::Writing(_) => None,
        }
    }
    /// Current payload handle. Waits out an in-place write.
    pub(super) fn payload(&self) -> Arc<Payload> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                TileState::Stable(payload) | TileState::Writing(Some(payload)) => return payload.clone(),
                TileState::Writing(None) => self.changed.wait(&mut state),
            }
        }
    }
    /// Current pixels, restored from swap if needed.
    pub(super) fn data(&self, tick: u64) -> Result<Arc<TileData>, TileError> {
        let payload = self.payload();
        payload.touch(tick);
        payload.data(self.coord)
    }
    /// Take the pixels for writing.
    ///
    /// `record` sees the pre-write payload while this tile is still locked, before anything
    /// changes. If the pixels are referenced anywhere else they're copied, and the original stays
    /// visible to readers until [`Tile::publish`].
    pub(super) fn lock_for_write(&self, record: impl FnOnce(&Arc<Payload>)) -> Result<TileData, TileError> {
        let mut state = self.state.lock();
        let current = loop {
            match &*state {
                TileState::Stable(payload) => break payload.clone(),
                TileState::Writing(_) => self.changed.wait(&mut state),
            }
        };
        // Errors leave the tile as it was.
        let data = current.data(self.coord)?;
        *state = TileState::Writing(None);
        record(&current);
        let working = match Arc::try_unwrap(current) {
            Ok(unshared) => {
                drop(unshared);
                match Arc::try_unwrap(data) {
                    // Nobody else can see it, so the write happens in place.
                    // Readers of this tile wait for the publish.
                    Ok(data) => data,
                    Err(read) => {
                        let copy = TileData::clone(&read);
                        *state = TileState::Writing(Some(Payload::shared(read, self.swap.clone(), 0)));
                        copy
                    }
                }
            }
            Err(shared) => {
                *state = TileState::Writing(Some(shared));
                TileData::clone(&data)
            }
        };
        Ok(working)
    }
    pub(super) fn publish(&self, data: TileData, tick: u64) {
        let mut state = self.state.lock();
        debug_assert!(matches!(*state, TileState::Writing(_)));
        *state = TileState::Stable(Payload::new(data, self.swap.clone(), tick));
        self.changed.notify_all();
    }
    /// Replace the payload wholesale.
    pub(super) fn install(&self, payload: Arc<Payload>) {
        let mut state = self.state.lock();
        while matches!(*state, TileState::Writing(_)) {
            self.changed.wait(&mut state);
        }
        *state = TileState::Stable(payload);
        self.changed.notify_all();
    }
}
impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("coord", &self.coord)
            .finish_non_exhaustive()
    }
}

/// Stable view of a tile's pixels. Concurrent writers never disturb it.
pub struct TileReadGuard {
    pub(super) coord: TileCoord,
    pub(super) data: Arc<TileData>,
}
impl TileReadGuard {
    #[must_use]
    pub fn coord(&self) -> TileCoord {
        self.coord
    }
}
impl std::ops::Deref for TileReadGuard {
    type Target = TileData;
    fn deref(&self) -> &TileData {
        &self.data
    }
}

/// Exclusive, mutable view of a tile's pixels. The write becomes visible on drop.
pub struct TileWriteGuard {
    pub(super) tile: Arc<Tile>,
    pub(super) data: Option<TileData>,
    pub(super) tick: u64,
}
impl TileWriteGuard {
    #[must_use]
    pub fn coord(&self) -> TileCoord {
        self.tile.coord
    }
}
impl std::ops::Deref for TileWriteGuard {
    type Target = TileData;
    fn deref(&self) -> &TileData {
        // Only taken in drop.
        self.data.as_ref().unwrap()
    }
}
impl std::ops::DerefMut for TileWriteGuard {
    fn deref_mut(&mut self) -> &mut TileData {
        self.data.as_mut().unwrap()
    }
}
impl Drop for TileWriteGuard {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.tile.publish(data, self.tick);
        }
    }
}
