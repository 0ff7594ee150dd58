//! # Level of detail
//! Interactive strokes may first run against a reduced resolution preview, "LOD n", where one
//! preview pixel covers `2^n` image pixels on each side. Anything positioned in the image keeps a
//! separate offset for the preview plane, so a preview stroke never disturbs the real one.

use crate::util::{Point, Rect};

/// Mapping between image coordinates and the coordinates of LOD `level`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LodTransform {
    level: u32,
}
impl LodTransform {
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self { level }
    }
    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }
    #[must_use]
    pub fn scale(&self) -> f64 {
        1.0 / f64::from(1u32 << self.level)
    }
    /// Image to preview. Rounds toward negative infinity.
    #[must_use]
    pub fn map_point(&self, point: Point) -> Point {
        Point::new(point.x >> self.level, point.y >> self.level)
    }
    /// Preview to image.
    #[must_use]
    pub fn map_point_inverted(&self, point: Point) -> Point {
        Point::new(point.x << self.level, point.y << self.level)
    }
    /// Image to preview, growing outward so the result covers every touched preview pixel.
    #[must_use]
    pub fn map_rect(&self, rect: Rect) -> Rect {
        if rect.is_empty() {
            return Rect::EMPTY;
        }
        let round_up = (1 << self.level) - 1;
        Rect::from_edges(
            rect.left() >> self.level,
            rect.top() >> self.level,
            (rect.right() + round_up) >> self.level,
            (rect.bottom() + round_up) >> self.level,
        )
    }
    #[must_use]
    pub fn map_rect_inverted(&self, rect: Rect) -> Rect {
        if rect.is_empty() {
            return Rect::EMPTY;
        }
        Rect::from_edges(
            rect.left() << self.level,
            rect.top() << self.level,
            rect.right() << self.level,
            rect.bottom() << self.level,
        )
    }
}

/// Image position plus an independent position on one preview plane.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlanarOffset {
    base: Point,
    preview: Option<(u32, Point)>,
}
impl PlanarOffset {
    #[must_use]
    pub fn new(base: Point) -> Self {
        Self { base, preview: None }
    }
    /// Position as seen at `level`. A plane that was never synced derives from the image position.
    #[must_use]
    pub fn get(&self, level: u32) -> Point {
        if level == 0 {
            return self.base;
        }
        match self.preview {
            Some((synced, point)) if synced == level => point,
            _ => LodTransform::new(level).map_point(self.base),
        }
    }
    pub fn set(&mut self, level: u32, point: Point) {
        if level == 0 {
            self.base = point;
        } else {
            self.preview = Some((level, point));
        }
    }
    /// Reset the preview plane of `level` from the image position.
    pub fn sync(&mut self, level: u32) {
        if level > 0 {
            self.preview = Some((level, LodTransform::new(level).map_point(self.base)));
        }
    }
}
