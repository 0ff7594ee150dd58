use std::sync::Arc;

use super::PainterBase;
use crate::{
    device::Pixel,
    node::Node,
    strokes::{JobContext, Sequentiality, StrokeError, StrokeJobData, StrokeStrategy},
    undo::UndoStack,
    updates::UpdatesHandle,
    util::Rect,
};

/// Per-pixel transform run by a [`FilterStrategy`].
pub trait PixelFilter: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn apply(&self, pixel: &mut [u8]);
}

/// Inverts color channels. Four byte pixels keep their alpha.
#[derive(Copy, Clone, Debug, Default)]
pub struct InvertFilter;
impl PixelFilter for InvertFilter {
    fn name(&self) -> &str {
        "Invert"
    }
    fn apply(&self, pixel: &mut [u8]) {
        let color = if pixel.len() == 4 { &mut pixel[..3] } else { pixel };
        for channel in color {
            *channel = !*channel;
        }
    }
}

/// Replaces every pixel with a fixed one.
#[derive(Clone, Debug)]
pub struct FillFilter {
    pub pixel: Pixel,
}
impl PixelFilter for FillFilter {
    fn name(&self) -> &str {
        "Fill"
    }
    fn apply(&self, pixel: &mut [u8]) {
        if pixel.len() == self.pixel.len() {
            pixel.copy_from_slice(&self.pixel);
        }
    }
}

/// One image rect to filter. Rects of one stroke must not overlap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FilterJob {
    pub rect: Rect,
}
impl FilterJob {
    /// Jobs covering `rect`, cut along tile boundaries so that no two share a tile.
    #[must_use]
    pub fn split(rect: Rect, tile_size: u32) -> Vec<Self> {
        rect.split_aligned(tile_size)
            .into_iter()
            .map(|rect| Self { rect })
            .collect()
    }
}
impl StrokeJobData for FilterJob {
    fn sequentiality(&self) -> Sequentiality {
        Sequentiality::Concurrent
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Runs a [`PixelFilter`] over the rects it's given, concurrently. Pixel data has no preview
/// planes, so filters are never previewed.
pub struct FilterStrategy {
    base: PainterBase,
    filter: Arc<dyn PixelFilter>,
}
impl FilterStrategy {
    /// `None` if `node` has no pixels.
    #[must_use]
    pub fn new(node: Arc<Node>, filter: Arc<dyn PixelFilter>, stack: Arc<UndoStack>, updates: UpdatesHandle) -> Option<Self> {
        let base = PainterBase::new(filter.name(), node, stack, updates)?;
        Some(Self { base, filter })
    }
}
impl StrokeStrategy for FilterStrategy {
    fn name(&self) -> &str {
        "filter"
    }
    fn init(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        self.base.begin();
        Ok(())
    }
    fn do_job(&self, ctx: &JobContext, data: Box<dyn StrokeJobData>) -> Result<(), StrokeError> {
        let Some(job) = data.downcast_ref::<FilterJob>() else {
            log::warn!("filter got unexpected job {data:?}");
            return Ok(());
        };
        self.base
            .device
            .process_rect(job.rect, || ctx.is_cancelled(), |_, _, pixel| self.filter.apply(pixel))?;
        self.base.refresh(job.rect);
        Ok(())
    }
    fn finish(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        self.base.finish()
    }
    fn cancel(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        self.base.cancel()
    }
}
