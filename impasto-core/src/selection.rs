//! Pixel selections.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    device::{DeviceError, PaintDevice},
    util::{Point, Rect},
};

/// A one byte per pixel coverage mask. Nonzero is selected.
///
/// A selection may also carry a vector shape. Shapes can't be previewed at reduced resolution,
/// so strokes moving such a selection refuse LOD clones.
#[derive(Debug)]
pub struct Selection {
    mask: Arc<PaintDevice>,
    has_shape: bool,
    visible: AtomicBool,
}
impl Selection {
    pub fn new(tile_size: u32) -> Result<Self, DeviceError> {
        Ok(Self {
            mask: Arc::new(PaintDevice::new(tile_size, &[0], None)?),
            has_shape: false,
            visible: AtomicBool::new(true),
        })
    }
    /// Selection of exactly `rect`.
    pub fn from_rect(tile_size: u32, rect: Rect) -> Result<Self, DeviceError> {
        let selection = Self::new(tile_size)?;
        selection.mask.fill_rect(rect, &[0xFF])?;
        Ok(selection)
    }
    /// Mark the selection as backed by a vector shape.
    #[must_use]
    pub fn with_shape(mut self) -> Self {
        self.has_shape = true;
        self
    }
    #[must_use]
    pub fn mask(&self) -> &Arc<PaintDevice> {
        &self.mask
    }
    #[must_use]
    pub fn has_shape_selection(&self) -> bool {
        self.has_shape
    }
    pub fn selected_rect(&self) -> Result<Rect, DeviceError> {
        self.mask.exact_bounds()
    }
    pub fn is_selected(&self, x: i32, y: i32) -> Result<bool, DeviceError> {
        Ok(self.mask.pixel(x, y)?[0] != 0)
    }
    #[must_use]
    pub fn offset(&self) -> Point {
        self.mask.offset()
    }
    pub fn set_offset(&self, offset: Point) {
        self.mask.set_offset(offset);
    }
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }
    /// Hide or show the selection outline. Does not change what's selected.
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn rect_selection_moves() {
        let selection = Selection::from_rect(64, Rect::new(10, 10, 5, 5)).unwrap();
        assert!(selection.is_selected(10, 10).unwrap());
        assert!(!selection.is_selected(15, 10).unwrap());
        selection.set_offset(Point::new(50, 0));
        assert!(selection.is_selected(60, 10).unwrap());
        assert_eq!(selection.selected_rect().unwrap(), Rect::new(60, 10, 5, 5));
    }
}
