//! Stroke execution engine over tiled, copy-on-write raster storage.
//!
//! Pixels live in [`tiles`], swapped out through [`swap`] when cold, and are addressed through
//! [`device::PaintDevice`]s placed in a [`node`] tree. Edits run as [`strokes`] whose jobs the
//! scheduler orders and parallelizes, with every change recorded in the [`undo`] history.
//! [`image::Image`] bundles it all.

pub mod config;
pub mod device;
pub mod id;
pub mod image;
pub mod io;
pub mod lod;
pub mod node;
pub mod selection;
pub mod strategies;
pub mod strokes;
pub mod swap;
pub mod tiles;
pub mod undo;
pub mod updates;
pub mod util;

mod compose;

pub use id::UniqueId;
pub use util::{Point, Rect};
