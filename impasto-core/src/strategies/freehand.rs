use std::sync::Arc;

use super::PainterBase;
use crate::{
    device::{DeviceError, Pixel},
    node::Node,
    strokes::{JobContext, StrokeError, StrokeJobData, StrokeStrategy},
    undo::UndoStack,
    updates::UpdatesHandle,
    util::{Point, Rect},
};

/// A filled round dab.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DabJob {
    pub center: Point,
    pub radius: u32,
    pub pixel: Pixel,
}
impl DabJob {
    #[must_use]
    pub fn bounds(&self) -> Rect {
        let radius = self.radius as i32;
        Rect::new(
            self.center.x - radius,
            self.center.y - radius,
            radius * 2 + 1,
            radius * 2 + 1,
        )
    }
}
impl StrokeJobData for DabJob {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Paints dabs, in order, into one layer.
pub struct FreehandStrategy {
    base: PainterBase,
    opacity: u8,
}
impl FreehandStrategy {
    /// `None` if `node` has no pixels.
    #[must_use]
    pub fn new(node: Arc<Node>, stack: Arc<UndoStack>, updates: UpdatesHandle) -> Option<Self> {
        Some(Self {
            base: PainterBase::new("Freehand", node, stack, updates)?,
            opacity: u8::MAX,
        })
    }
    #[must_use]
    pub fn with_opacity(mut self, opacity: u8) -> Self {
        self.opacity = opacity;
        self
    }
}
impl StrokeStrategy for FreehandStrategy {
    fn name(&self) -> &str {
        "freehand"
    }
    fn init(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        self.base.begin();
        Ok(())
    }
    fn do_job(&self, _ctx: &JobContext, data: Box<dyn StrokeJobData>) -> Result<(), StrokeError> {
        let Some(dab) = data.downcast_ref::<DabJob>() else {
            log::warn!("freehand got unexpected job {data:?}");
            return Ok(());
        };
        let device = &self.base.device;
        if dab.pixel.len() != device.pixel_size() {
            return Err(DeviceError::PixelSize {
                expected: device.pixel_size(),
                got: dab.pixel.len(),
            }
            .into());
        }
        let radius_sq = i64::from(dab.radius) * i64::from(dab.radius);
        let rect = dab.bounds();
        device.process_rect(
            rect,
            || false,
            |x, y, pixel| {
                let dx = i64::from(x - dab.center.x);
                let dy = i64::from(y - dab.center.y);
                if dx * dx + dy * dy <= radius_sq {
                    crate::compose::over(pixel, &dab.pixel, self.opacity);
                }
            },
        )?;
        self.base.refresh(rect);
        Ok(())
    }
    fn finish(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        self.base.finish()
    }
    fn cancel(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        self.base.cancel()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        device::PaintDevice, strategies::test_support::InlineStroke, updates::test_support::RecordingUpdates,
    };

    #[test]
    fn dabs_are_round_and_undoable() {
        let device = Arc::new(PaintDevice::new(16, &[0; 4], None).unwrap());
        let node = Node::new_paint_layer("ink", device.clone());
        let stack = Arc::new(UndoStack::new());
        let recorder = Arc::new(RecordingUpdates::default());
        let strategy = FreehandStrategy::new(node, stack.clone(), recorder.handle()).unwrap();
        let stroke = InlineStroke::start(Arc::new(strategy));
        for x in [10, 14] {
            stroke.job(Box::new(DabJob {
                center: Point::new(x, 10),
                radius: 3,
                pixel: Pixel::from_slice(&[0, 0, 0xFF, 0xFF]),
            }));
        }
        stroke.finish();
        assert_eq!(device.pixel(10, 10).unwrap().as_slice(), [0, 0, 0xFF, 0xFF]);
        assert_eq!(device.pixel(17, 10).unwrap().as_slice(), [0, 0, 0xFF, 0xFF]);
        // Corner of the bounding box is outside the circle.
        assert_eq!(device.pixel(7, 7).unwrap().as_slice(), [0; 4]);
        assert_eq!(device.exact_bounds().unwrap(), Rect::new(7, 7, 11, 7));
        assert_eq!(stack.depth(), 1);
        stack.undo().unwrap();
        assert_eq!(device.exact_bounds().unwrap(), Rect::EMPTY);
    }
    #[test]
    fn wrong_pixel_size_fails() {
        let device = Arc::new(PaintDevice::new(16, &[0; 4], None).unwrap());
        let node = Node::new_paint_layer("ink", device);
        let recorder = Arc::new(RecordingUpdates::default());
        let strategy = FreehandStrategy::new(node, Arc::new(UndoStack::new()), recorder.handle()).unwrap();
        let ctx = JobContext::new(crate::strokes::StrokeId::new(), 0, Default::default());
        strategy.init(&ctx).unwrap();
        let dab = DabJob {
            center: Point::ZERO,
            radius: 1,
            pixel: Pixel::from_slice(&[1]),
        };
        assert!(matches!(
            strategy.do_job(&ctx, Box::new(dab)),
            Err(StrokeError::Device(DeviceError::PixelSize { expected: 4, got: 1 }))
        ));
    }
}
