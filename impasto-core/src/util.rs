//! Integer geometry shared by the tile store, devices and strokes.

/// Position or displacement in image pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}
impl Point {
    pub const ZERO: Self = Self { x: 0, y: 0 };
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}
impl std::ops::Add for Point {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}
impl std::ops::Sub for Point {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}
impl std::ops::Neg for Point {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}
impl std::ops::AddAssign for Point {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Axis-aligned pixel rectangle. `width` and `height` of zero or less is the empty rect,
/// and all empty rects compare equal through [`Rect::is_empty`] only.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}
impl Rect {
    pub const EMPTY: Self = Self {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };
    #[must_use]
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
    /// Rect spanning `[left, right) x [top, bottom)`.
    #[must_use]
    pub fn from_edges(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(left, top, right - left, bottom - top)
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
    #[must_use]
    pub fn left(&self) -> i32 {
        self.x
    }
    #[must_use]
    pub fn top(&self) -> i32 {
        self.y
    }
    /// Exclusive.
    #[must_use]
    pub fn right(&self) -> i32 {
        self.x + self.width
    }
    /// Exclusive.
    #[must_use]
    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }
    #[must_use]
    pub fn top_left(&self) -> Point {
        Point::new(self.x, self.y)
    }
    /// Number of pixels covered, zero if empty.
    #[must_use]
    pub fn area(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.width as usize * self.height as usize
        }
    }
    #[must_use]
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left() && x < self.right() && y >= self.top() && y < self.bottom()
    }
    #[must_use]
    pub fn translated(&self, by: Point) -> Self {
        Self::new(self.x + by.x, self.y + by.y, self.width, self.height)
    }
    /// Smallest rect covering both. Empty rects are ignored.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => Self::EMPTY,
            (true, false) => *other,
            (false, true) => *self,
            (false, false) => Self::from_edges(
                self.left().min(other.left()),
                self.top().min(other.top()),
                self.right().max(other.right()),
                self.bottom().max(other.bottom()),
            ),
        }
    }
    /// Overlap of both, or [`Rect::EMPTY`].
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let rect = Self::from_edges(
            self.left().max(other.left()),
            self.top().max(other.top()),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        );
        if rect.is_empty() {
            Self::EMPTY
        } else {
            rect
        }
    }
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        !self.intersect(other).is_empty()
    }
    /// Split into patches no larger than `size` on each side, aligned to multiples of `size`.
    #[must_use]
    pub fn split_aligned(&self, size: u32) -> Vec<Self> {
        if self.is_empty() || size == 0 {
            return Vec::new();
        }
        let size = size as i32;
        let mut patches = Vec::new();
        let mut row = self.top().div_euclid(size);
        while row * size < self.bottom() {
            let mut col = self.left().div_euclid(size);
            while col * size < self.right() {
                let patch = Self::new(col * size, row * size, size, size).intersect(self);
                if !patch.is_empty() {
                    patches.push(patch);
                }
                col += 1;
            }
            row += 1;
        }
        patches
    }
}
impl std::ops::BitOr for Rect {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(&rhs)
    }
}
impl std::ops::BitOrAssign for Rect {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(&rhs);
    }
}

#[cfg(test)]
mod test {
    use super::{Point, Rect};
    #[test]
    fn union_ignores_empty() {
        let a = Rect::new(10, 10, 5, 5);
        assert_eq!(a | Rect::EMPTY, a);
        assert_eq!(Rect::EMPTY | a, a);
        assert_eq!(a | Rect::new(0, 0, 1, 1), Rect::new(0, 0, 15, 15));
    }
    #[test]
    fn intersection() {
        let a = Rect::new(0, 0, 10, 10);
        assert_eq!(a.intersect(&Rect::new(5, 5, 10, 10)), Rect::new(5, 5, 5, 5));
        assert!(!a.intersects(&Rect::new(10, 0, 4, 4)));
        assert!(a.intersect(&Rect::new(-5, -5, 2, 2)).is_empty());
    }
    #[test]
    fn split_aligned_covers_exactly() {
        let rect = Rect::new(-10, 5, 100, 70);
        let patches = rect.split_aligned(64);
        let area: usize = patches.iter().map(Rect::area).sum();
        assert_eq!(area, rect.area());
        let covered = patches.iter().fold(Rect::EMPTY, |acc, p| acc | *p);
        assert_eq!(covered, rect);
        // Aligned patches never straddle a 64px boundary.
        for patch in &patches {
            assert_eq!(patch.left().div_euclid(64), (patch.right() - 1).div_euclid(64));
        }
    }
    #[test]
    fn translate() {
        assert_eq!(
            Rect::new(1, 2, 3, 4).translated(Point::new(-1, 8)),
            Rect::new(0, 10, 3, 4)
        );
    }
}
