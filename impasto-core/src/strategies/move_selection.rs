use std::sync::Arc;

use parking_lot::Mutex;

use super::MoveJob;
use crate::{
    device::PaintDevice,
    node::{Node, TemporaryTarget},
    selection::Selection,
    strokes::{
        EventSink, Exclusivity, JobContext, StrokeError, StrokeEvent, StrokeJobData, StrokeStrategy,
        UndoBridge,
    },
    undo::{MacroId, SelectionMoveCommand, UndoStack, UpdateCommand},
    updates::UpdatesHandle,
    util::{Point, Rect},
};

#[derive(Default)]
struct Floating {
    /// Pixels cut out of the layer, moved around as a temporary target.
    device: Option<Arc<PaintDevice>>,
    /// Where the cut pixels came from.
    source_rect: Rect,
    selection_start: Point,
    offset: Point,
}

/// Cuts the selected pixels of a layer, floats them above it while moving, and pastes them back
/// at the final position together with the selection.
pub struct MoveSelectionStrategy {
    node: Arc<Node>,
    device: Arc<PaintDevice>,
    selection: Arc<Selection>,
    floating: Mutex<Floating>,
    updates: UpdatesHandle,
    events: EventSink,
    bridge: UndoBridge,
}
impl MoveSelectionStrategy {
    /// `None` if `node` has no pixels.
    #[must_use]
    pub fn new(
        node: Arc<Node>,
        selection: Arc<Selection>,
        stack: Arc<UndoStack>,
        updates: UpdatesHandle,
        events: EventSink,
    ) -> Option<Self> {
        let device = node.device()?.clone();
        Some(Self {
            node,
            device,
            selection,
            floating: Mutex::new(Floating::default()),
            updates,
            events,
            bridge: UndoBridge::new("Move Selection", stack).with_macro_id(MacroId::MOVE_SELECTION),
        })
    }
}
impl StrokeStrategy for MoveSelectionStrategy {
    fn name(&self) -> &str {
        "move selection"
    }
    fn finish_exclusivity(&self) -> Exclusivity {
        Exclusivity::Exclusive
    }
    fn init(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        let rect = self.selection.selected_rect()?;
        if rect.is_empty() {
            log::debug!("nothing selected to move");
            self.events.emit(StrokeEvent::StartedEmpty);
            return Ok(());
        }
        let floating = Arc::new(PaintDevice::new_like(&self.device));
        floating.copy_masked_from(&self.device, self.selection.mask(), rect)?;

        let transaction = self.device.transaction("Cut Selection");
        self.device.clear_masked(self.selection.mask(), rect)?;
        let cut = transaction.commit()?;
        self.bridge.notify_command_done(Box::new(UpdateCommand::new(
            self.node.clone(),
            rect,
            self.updates.clone(),
            Box::new(cut),
        )));

        self.node.set_temporary_target(Some(TemporaryTarget {
            device: floating.clone(),
            opacity: u8::MAX,
        }));
        *self.floating.lock() = Floating {
            device: Some(floating),
            source_rect: rect,
            selection_start: self.selection.offset(),
            offset: Point::ZERO,
        };
        self.selection.set_visible(false);
        self.events.emit(StrokeEvent::HandlesRectCalculated(rect));
        Ok(())
    }
    fn do_job(&self, _ctx: &JobContext, data: Box<dyn StrokeJobData>) -> Result<(), StrokeError> {
        let Some(job) = data.downcast_ref::<MoveJob>() else {
            log::warn!("selection move got unexpected job {data:?}");
            return Ok(());
        };
        let mut floating = self.floating.lock();
        let Some(device) = floating.device.clone() else {
            return Ok(());
        };
        let dirty = floating.source_rect.translated(floating.offset) | floating.source_rect.translated(job.offset);
        floating.offset = job.offset;
        device.set_offset(job.offset);
        drop(floating);
        self.updates.refresh(&self.node, dirty);
        Ok(())
    }
    fn finish(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        let floating = std::mem::take(&mut *self.floating.lock());
        let Some(device) = floating.device else {
            return Ok(self.bridge.finish()?);
        };
        let _ = self.node.take_temporary_target();
        let dirty = floating.source_rect | floating.source_rect.translated(floating.offset);

        let transaction = self.device.transaction("Paste Selection");
        if let Err(err) = self.device.merge_from(&device, u8::MAX) {
            // Undo whatever part of the paste landed.
            match transaction.revert() {
                Ok(rect) => self.updates.refresh(&self.node, rect | dirty),
                Err(revert_err) => log::error!("reverting failed paste: {revert_err}"),
            }
            return Err(err.into());
        }
        let paste = transaction.commit()?;
        self.bridge.notify_command_done(Box::new(UpdateCommand::new(
            self.node.clone(),
            dirty,
            self.updates.clone(),
            Box::new(paste),
        )));

        // The selection moves without recompositing, the paste above covers it.
        self.updates.block();
        let moved = self.bridge.run_and_save_command(Box::new(SelectionMoveCommand::new(
            self.selection.clone(),
            floating.selection_start + floating.offset,
        )));
        self.updates.unblock();
        moved?;

        self.selection.set_visible(true);
        self.updates.refresh(&self.node, dirty);
        Ok(self.bridge.finish()?)
    }
    fn cancel(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        let floating = std::mem::take(&mut *self.floating.lock());
        let _ = self.node.take_temporary_target();
        self.selection.set_visible(true);
        self.bridge.cancel()?;
        let dirty = floating.source_rect | floating.source_rect.translated(floating.offset);
        self.updates.refresh(&self.node, dirty);
        Ok(())
    }
    fn create_lod_clone(&self, level: u32) -> Option<Arc<dyn StrokeStrategy>> {
        if self.selection.has_shape_selection() {
            log::debug!("shape selections can't be previewed at LOD {level}");
            return None;
        }
        Some(Arc::new(OutlinePreview {
            selection: self.selection.clone(),
            start: Mutex::new(Point::ZERO),
        }))
    }
}

/// Preview of a selection move: only the selection outline moves, on its preview plane.
struct OutlinePreview {
    selection: Arc<Selection>,
    start: Mutex<Point>,
}
impl StrokeStrategy for OutlinePreview {
    fn name(&self) -> &str {
        "move selection preview"
    }
    fn init(&self, ctx: &JobContext) -> Result<(), StrokeError> {
        let mask = self.selection.mask();
        mask.sync_lod_plane(ctx.lod());
        *self.start.lock() = mask.offset_at(ctx.lod());
        Ok(())
    }
    fn do_job(&self, ctx: &JobContext, data: Box<dyn StrokeJobData>) -> Result<(), StrokeError> {
        if let Some(job) = data.downcast_ref::<MoveJob>() {
            let start = *self.start.lock();
            self.selection.mask().set_offset_at(ctx.lod(), start + job.offset);
        }
        Ok(())
    }
    fn cancel(&self, ctx: &JobContext) -> Result<(), StrokeError> {
        let start = *self.start.lock();
        self.selection.mask().set_offset_at(ctx.lod(), start);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        strategies::test_support::InlineStroke,
        strokes::{CancellationToken, StrokeId},
        swap::{RleCodec, SwapBackend, SwapError, SwapSlot, Swapper},
        updates::test_support::RecordingUpdates,
    };

    const RED: [u8; 4] = [0xFF, 0, 0, 0xFF];
    const BLUE: [u8; 4] = [0, 0, 0xFF, 0xFF];

    struct Fixture {
        node: Arc<Node>,
        device: Arc<PaintDevice>,
        selection: Arc<Selection>,
        stack: Arc<UndoStack>,
        recorder: Arc<RecordingUpdates>,
    }
    fn fixture() -> Fixture {
        let device = Arc::new(PaintDevice::new(16, &[0; 4], None).unwrap());
        device.fill_rect(Rect::new(0, 0, 32, 32), &BLUE).unwrap();
        device.fill_rect(Rect::new(4, 4, 4, 4), &RED).unwrap();
        Fixture {
            node: Node::new_paint_layer("layer", device.clone()),
            device,
            selection: Arc::new(Selection::from_rect(16, Rect::new(4, 4, 4, 4)).unwrap()),
            stack: Arc::new(UndoStack::new()),
            recorder: Arc::new(RecordingUpdates::default()),
        }
    }
    impl Fixture {
        fn strategy(&self, events: EventSink) -> Arc<MoveSelectionStrategy> {
            Arc::new(
                MoveSelectionStrategy::new(
                    self.node.clone(),
                    self.selection.clone(),
                    self.stack.clone(),
                    self.recorder.handle(),
                    events,
                )
                .unwrap(),
            )
        }
    }

    #[test]
    fn moves_pixels_and_selection() {
        let f = fixture();
        let before = f.device.content_hash().unwrap();
        let (events, received) = EventSink::channel();
        let stroke = InlineStroke::start(f.strategy(events));
        assert!(!f.selection.is_visible());
        assert!(f.node.temporary_target().is_some());
        assert_eq!(f.device.pixel(5, 5).unwrap().as_slice(), [0; 4]);

        stroke.job(Box::new(MoveJob { offset: Point::new(10, 12) }));
        stroke.finish();

        assert!(f.node.temporary_target().is_none());
        assert!(f.selection.is_visible());
        assert_eq!(f.device.pixel(15, 17).unwrap().as_slice(), RED);
        assert_eq!(f.device.pixel(5, 5).unwrap().as_slice(), [0; 4]);
        assert!(f.selection.is_selected(15, 17).unwrap());
        assert!(!f.selection.is_selected(5, 5).unwrap());
        assert_eq!(
            received.try_iter().collect::<Vec<_>>(),
            [StrokeEvent::HandlesRectCalculated(Rect::new(4, 4, 4, 4))]
        );
        assert_eq!(*f.recorder.blocked.lock(), 0);

        assert_eq!(f.stack.depth(), 1);
        f.stack.undo().unwrap();
        assert_eq!(f.device.content_hash().unwrap(), before);
        assert_eq!(f.selection.offset(), Point::ZERO);
    }
    #[test]
    fn cancel_puts_pixels_back() {
        let f = fixture();
        let before = f.device.content_hash().unwrap();
        let stroke = InlineStroke::start(f.strategy(EventSink::disconnected()));
        stroke.job(Box::new(MoveJob { offset: Point::new(3, 3) }));
        stroke.cancel();
        assert_eq!(f.device.content_hash().unwrap(), before);
        assert!(f.node.temporary_target().is_none());
        assert!(f.selection.is_visible());
        assert_eq!(f.selection.offset(), Point::ZERO);
        assert_eq!(f.stack.depth(), 0);
    }
    #[test]
    fn empty_selection_does_nothing() {
        let f = fixture();
        let selection = Arc::new(Selection::new(16).unwrap());
        let (events, received) = EventSink::channel();
        let strategy = Arc::new(
            MoveSelectionStrategy::new(f.node.clone(), selection, f.stack.clone(), f.recorder.handle(), events)
                .unwrap(),
        );
        let stroke = InlineStroke::start(strategy);
        stroke.job(Box::new(MoveJob { offset: Point::new(3, 3) }));
        stroke.finish();
        assert_eq!(received.try_iter().collect::<Vec<_>>(), [StrokeEvent::StartedEmpty]);
        assert_eq!(f.stack.depth(), 0);
    }
    #[test]
    fn preview_moves_outline_only() {
        let f = fixture();
        let strategy = f.strategy(EventSink::disconnected());
        let preview = InlineStroke::start_at(strategy.create_lod_clone(2).unwrap(), 2);
        let job = MoveJob { offset: Point::new(8, 4) };
        preview.job(job.create_lod_clone(2).unwrap());
        preview.finish();
        assert_eq!(f.selection.mask().offset_at(2), Point::new(2, 1));
        assert_eq!(f.selection.offset(), Point::ZERO);
        assert_eq!(f.device.pixel(5, 5).unwrap().as_slice(), RED);
    }
    #[test]
    fn shape_selections_refuse_preview() {
        let f = fixture();
        let selection = Arc::new(Selection::from_rect(16, Rect::new(0, 0, 2, 2)).unwrap().with_shape());
        let strategy = MoveSelectionStrategy::new(
            f.node.clone(),
            selection,
            f.stack.clone(),
            f.recorder.handle(),
            EventSink::disconnected(),
        )
        .unwrap();
        assert!(strategy.create_lod_clone(1).is_none());
    }
    #[test]
    fn failed_paste_is_reverted() {
        // Stores succeed, loads always fail.
        struct Forgetful;
        impl SwapBackend for Forgetful {
            fn store(&self, bytes: &[u8]) -> Result<SwapSlot, SwapError> {
                Ok(SwapSlot {
                    offset: 0,
                    len: bytes.len() as u32,
                    capacity: bytes.len() as u32,
                    checksum: 0,
                })
            }
            fn load(&self, _: &SwapSlot, _: &mut Vec<u8>) -> Result<(), SwapError> {
                Err(SwapError::Malformed("forgotten"))
            }
            fn release(&self, _: &SwapSlot) {}
            fn bytes_in_use(&self) -> u64 {
                0
            }
        }
        let swap = Arc::new(Swapper::new(Box::new(RleCodec), Box::new(Forgetful)));
        let device = Arc::new(PaintDevice::new(16, &[0; 4], Some(swap)).unwrap());
        device.fill_rect(Rect::new(0, 0, 32, 32), &BLUE).unwrap();
        let mut f = fixture();
        f.node = Node::new_paint_layer("layer", device.clone());
        f.device = device;
        f.selection = Arc::new(Selection::from_rect(16, Rect::new(4, 4, 16, 16)).unwrap());

        let before = f.device.content_hash().unwrap();
        let strategy = f.strategy(EventSink::disconnected());
        let stroke = InlineStroke::start(strategy.clone());
        stroke.job(Box::new(MoveJob { offset: Point::new(2, 2) }));
        let cut = f.device.content_hash().unwrap();

        // The first floating tile stays readable, the rest are lost, so the paste fails midway.
        let floating = f.node.temporary_target().unwrap().device;
        let coords = floating.store().coords();
        assert!(coords.len() > 1);
        let pinned = floating.store().read(coords[0]).unwrap();
        floating.force_swap_out().unwrap();

        let ctx = JobContext::new(StrokeId::new(), 0, CancellationToken::default());
        assert!(strategy.finish(&ctx).is_err());
        drop(pinned);
        assert_eq!(f.device.content_hash().unwrap(), cut);
        assert_eq!(f.device.pixel(7, 7).unwrap().as_slice(), [0; 4]);
        // A failed job cancels the stroke, which puts the cut back.
        strategy.cancel(&ctx).unwrap();
        assert_eq!(f.device.content_hash().unwrap(), before);
    }
}
