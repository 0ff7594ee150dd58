use super::TileError;

/// Pixel payload of one square tile, row-major, `pixel_size` bytes per pixel.
///
/// Pixels are shared through `Arc<TileData>` between payloads and readers,
/// and are never mutated while shared. A writer either owns the only reference or works on a copy.
#[derive(Clone, PartialEq, Eq)]
pub struct TileData {
    bytes: Box<[u8]>,
    tile_size: u32,
    pixel_size: usize,
}
impl TileData {
    /// A tile where every pixel is `pixel`.
    #[must_use]
    pub fn filled(tile_size: u32, pixel: &[u8]) -> Self {
        debug_assert!(!pixel.is_empty());
        let count = tile_size as usize * tile_size as usize;
        Self {
            bytes: pixel.repeat(count).into_boxed_slice(),
            tile_size,
            pixel_size: pixel.len(),
        }
    }
    #[must_use]
    pub fn zeroed(tile_size: u32, pixel_size: usize) -> Self {
        let len = tile_size as usize * tile_size as usize * pixel_size;
        Self {
            bytes: vec![0; len].into_boxed_slice(),
            tile_size,
            pixel_size,
        }
    }
    /// Wrap existing bytes. Fails if the length does not match the geometry.
    pub fn from_bytes(tile_size: u32, pixel_size: usize, bytes: Box<[u8]>) -> Result<Self, TileError> {
        let expected = Self::byte_len(tile_size, pixel_size);
        if bytes.len() != expected {
            return Err(TileError::SizeMismatch {
                expected,
                got: bytes.len(),
            });
        }
        Ok(Self {
            bytes,
            tile_size,
            pixel_size,
        })
    }
    #[must_use]
    pub fn byte_len(tile_size: u32, pixel_size: usize) -> usize {
        tile_size as usize * tile_size as usize * pixel_size
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
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
    fn offset_of(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.tile_size && y < self.tile_size);
        (y as usize * self.tile_size as usize + x as usize) * self.pixel_size
    }
    /// Pixel at tile-local coordinates.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let start = self.offset_of(x, y);
        &self.bytes[start..start + self.pixel_size]
    }
    pub fn pixel_mut(&mut self, x: u32, y: u32) -> &mut [u8] {
        let start = self.offset_of(x, y);
        &mut self.bytes[start..start + self.pixel_size]
    }
    /// One row of pixels, `[x, x + width)` at tile-local `y`.
    #[must_use]
    pub fn span(&self, x: u32, y: u32, width: u32) -> &[u8] {
        let start = self.offset_of(x, y);
        &self.bytes[start..start + width as usize * self.pixel_size]
    }
    pub fn span_mut(&mut self, x: u32, y: u32, width: u32) -> &mut [u8] {
        let start = self.offset_of(x, y);
        &mut self.bytes[start..start + width as usize * self.pixel_size]
    }
    pub fn fill(&mut self, pixel: &[u8]) {
        for chunk in self.bytes.chunks_exact_mut(self.pixel_size) {
            chunk.copy_from_slice(pixel);
        }
    }
    /// Every pixel equals `pixel`.
    #[must_use]
    pub fn is_filled_with(&self, pixel: &[u8]) -> bool {
        pixel.len() == self.pixel_size && self.bytes.chunks_exact(self.pixel_size).all(|px| px == pixel)
    }
}
impl std::fmt::Debug for TileData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileData")
            .field("tile_size", &self.tile_size)
            .field("pixel_size", &self.pixel_size)
            .finish_non_exhaustive()
    }
}
