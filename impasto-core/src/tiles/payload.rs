use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{TileCoord, TileData, TileError};
use crate::swap::{SwapError, SwappedTile, Swapper};

enum PayloadState {
    Resident(Arc<TileData>),
    SwappedOut(SwappedTile),
    /// Some thread is reading the pixels back from swap.
    Restoring,
    /// Swap-in failed. The pixels are unrecoverable.
    Lost,
}

/// Immutable pixels of a tile, which may live compressed in swap while cold.
///
/// Tiles and undo history hold the same `Arc<Payload>` for the same content, so content kept
/// only by history swaps just like content a tile shows. Readers pin the pixels resident for as
/// long as they hold the [`TileData`].
pub struct Payload {
    state: Mutex<PayloadState>,
    restored: Condvar,
    swap: Option<Arc<Swapper>>,
    last_access: AtomicU64,
}
impl Payload {
    pub(crate) fn new(data: TileData, swap: Option<Arc<Swapper>>, tick: u64) -> Arc<Self> {
        Self::shared(Arc::new(data), swap, tick)
    }
    pub(crate) fn shared(data: Arc<TileData>, swap: Option<Arc<Swapper>>, tick: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PayloadState::Resident(data)),
            restored: Condvar::new(),
            swap,
            last_access: AtomicU64::new(tick),
        })
    }
    #[must_use]
    pub fn is_swapped_out(&self) -> bool {
        matches!(*self.state.lock(), PayloadState::SwappedOut(_))
    }
    #[must_use]
    pub fn is_lost(&self) -> bool {
        matches!(*self.state.lock(), PayloadState::Lost)
    }
    pub(crate) fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
    }
    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
    /// Resident pixels, read back from swap first if needed. `coord` names the tile in errors.
    pub(crate) fn data(&self, coord: TileCoord) -> Result<Arc<TileData>, TileError> {
        let mut state = self.state.lock();
        loop {
            match std::mem::replace(&mut *state, PayloadState::Restoring) {
                PayloadState::Resident(data) => {
                    *state = PayloadState::Resident(data.clone());
                    return Ok(data);
                }
                PayloadState::Lost => {
                    *state = PayloadState::Lost;
                    return Err(TileError::Lost(coord));
                }
                PayloadState::SwappedOut(swapped) => return self.restore(&mut state, swapped, coord),
                PayloadState::Restoring => self.restored.wait(&mut state),
            }
        }
    }
    /// Compress the pixels into swap, unless some reader holds them or there's no swapper.
    ///
    /// Returns whether the payload was swapped out. On error the pixels stay resident.
    pub(crate) fn swap_out(&self) -> Result<bool, SwapError> {
        let Some(swap) = self.swap.as_deref() else {
            return Ok(false);
        };
        let current = {
            let state = self.state.lock();
            match &*state {
                PayloadState::Resident(data) if Arc::strong_count(data) == 1 => data.clone(),
                _ => return Ok(false),
            }
        };
        let swapped = swap.swap_out(&current)?;
        let mut state = self.state.lock();
        match &*state {
            // Ours plus the state's reference: no reader picked it up in the meantime.
            PayloadState::Resident(data) if Arc::ptr_eq(data, &current) && Arc::strong_count(data) == 2 => {
                *state = PayloadState::SwappedOut(swapped);
                Ok(true)
            }
            _ => {
                swap.release(swapped);
                Ok(false)
            }
        }
    }
    fn restore(
        &self,
        state: &mut MutexGuard<'_, PayloadState>,
        swapped: SwappedTile,
        coord: TileCoord,
    ) -> Result<Arc<TileData>, TileError> {
        let loaded = MutexGuard::unlocked(state, || match self.swap.as_deref() {
            Some(swap) => swap.swap_in(&swapped),
            None => Err(SwapError::NoBackend),
        });
        let result = match loaded {
            Ok(data) => {
                let data = Arc::new(data);
                **state = PayloadState::Resident(data.clone());
                Ok(data)
            }
            Err(err) => {
                log::error!("swap-in of tile ({}, {}) failed, pixels are lost: {err}", coord.col, coord.row);
                **state = PayloadState::Lost;
                Err(TileError::Lost(coord))
            }
        };
        if let Some(swap) = self.swap.as_deref() {
            swap.release(swapped);
        }
        self.restored.notify_all();
        result
    }
}
impl Drop for Payload {
    fn drop(&mut self) {
        if let PayloadState::SwappedOut(swapped) = std::mem::replace(self.state.get_mut(), PayloadState::Lost) {
            if let Some(swap) = self.swap.as_deref() {
                swap.release(swapped);
            }
        }
    }
}
impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            PayloadState::Resident(_) => "resident",
            PayloadState::SwappedOut(_) => "swapped out",
            PayloadState::Restoring => "restoring",
            PayloadState::Lost => "lost",
        };
        f.debug_struct("Payload").field("state", &state).finish_non_exhaustive()
    }
}
