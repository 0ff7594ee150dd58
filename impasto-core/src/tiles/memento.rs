use std::sync::Arc;

use hashbrown::HashMap;

use super::{Payload, TileCoord};

/// Pre-write payloads of every tile touched while a memento is registered with a store.
/// Only the first write to each tile is kept. `None` marks a tile that didn't exist yet.
#[derive(Default)]
pub(crate) struct MementoLog {
    before: parking_lot::Mutex<HashMap<TileCoord, Option<Arc<Payload>>>>,
}
impl MementoLog {
    pub(super) fn record(&self, coord: TileCoord, previous: Option<Arc<Payload>>) {
        self.before.lock().entry(coord).or_insert(previous);
    }
    pub(super) fn take(&self) -> HashMap<TileCoord, Option<Arc<Payload>>> {
        std::mem::take(&mut *self.before.lock())
    }
}

/// Before and after payloads of the tiles changed by one transaction.
/// Payloads are shared with the store and swap out like any other, so history stays cheap.
#[derive(Default, Clone)]
pub struct TileChanges {
    pub(super) before: HashMap<TileCoord, Option<Arc<Payload>>>,
    pub(super) after: HashMap<TileCoord, Option<Arc<Payload>>>,
}
impl TileChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.before.is_empty()
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.before.len()
    }
    pub fn coords(&self) -> impl Iterator<Item = TileCoord> + '_ {
        self.before.keys().copied()
    }
    /// Fold a later change set into this one, as if both happened in a single transaction.
    pub fn absorb(&mut self, later: &Self) {
        for (coord, before) in &later.before {
            self.before.entry(*coord).or_insert_with(|| before.clone());
        }
        for (coord, after) in &later.after {
            self.after.insert(*coord, after.clone());
        }
    }
}
impl std::fmt::Debug for TileChanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileChanges")
            .field("tiles", &self.before.len())
            .finish()
    }
}
