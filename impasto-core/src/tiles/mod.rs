//! # Tiles
//! Pixel storage is split into square tiles addressed by `(col, row)`. Tiles are copy-on-write:
//! a payload may be shared by any number of tiles, readers and undo mementos, and a writer
//! only ever mutates a payload nobody else can observe.
//!
//! A [`Payload`] may additionally be compressed away into a [`crate::swap`] backend while it's
//! cold, whether a tile shows it or only undo history keeps it. Every accessor transparently
//! restores it first.

mod data;
mod memento;
mod payload;
mod store;
mod tile;

pub use data::TileData;
pub(crate) use memento::MementoLog;
pub use memento::TileChanges;
pub use payload::Payload;
pub use store::{StoreStats, TileStore};
pub use tile::{Tile, TileReadGuard, TileWriteGuard};

use crate::util::Rect;

/// Grid position of a tile.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub col: i32,
    pub row: i32,
}
impl TileCoord {
    #[must_use]
    pub const fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }
    /// Tile containing the store-local pixel `(x, y)`.
    #[must_use]
    pub fn containing(x: i32, y: i32, tile_size: u32) -> Self {
        let size = tile_size as i32;
        Self::new(x.div_euclid(size), y.div_euclid(size))
    }
    /// Store-local pixel area covered by this tile.
    #[must_use]
    pub fn rect(&self, tile_size: u32) -> Rect {
        let size = tile_size as i32;
        Rect::new(self.col * size, self.row * size, size, size)
    }
    /// All tiles intersecting a store-local rect, row-major.
    pub fn covering(rect: Rect, tile_size: u32) -> impl Iterator<Item = Self> {
        let size = tile_size as i32;
        let (cols, rows) = if rect.is_empty() {
            (0..0, 0..0)
        } else {
            (
                rect.left().div_euclid(size)..(rect.right() - 1).div_euclid(size) + 1,
                rect.top().div_euclid(size)..(rect.bottom() - 1).div_euclid(size) + 1,
            )
        };
        rows.flat_map(move |row| cols.clone().map(move |col| Self::new(col, row)))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TileError {
    #[error("tile ({}, {}) lost its pixels in a failed swap-in", .0.col, .0.row)]
    Lost(TileCoord),
    #[error(transparent)]
    Swap(#[from] crate::swap::SwapError),
    #[error("tile buffer is {got} bytes, expected {expected}")]
    SizeMismatch { expected: usize, got: usize },
}

#[cfg(test)]
mod test {
    use super::TileCoord;
    use crate::util::Rect;
    #[test]
    fn containing_negative() {
        assert_eq!(TileCoord::containing(-1, 0, 64), TileCoord::new(-1, 0));
        assert_eq!(TileCoord::containing(63, 64, 64), TileCoord::new(0, 1));
    }
    #[test]
    fn covering() {
        let tiles: Vec<_> = TileCoord::covering(Rect::new(60, 0, 10, 1), 64).collect();
        assert_eq!(tiles, vec![TileCoord::new(0, 0), TileCoord::new(1, 0)]);
        assert_eq!(TileCoord::covering(Rect::EMPTY, 64).count(), 0);
    }
}
