//! # Stroke strategies
//! Concrete kinds of strokes: moving nodes, moving selected pixels, filtering, painting, and
//! walking the undo history.

mod filter;
mod freehand;
mod move_nodes;
mod move_selection;
mod undo_command;

pub use filter::{FillFilter, FilterJob, FilterStrategy, InvertFilter, PixelFilter};
pub use freehand::{DabJob, FreehandStrategy};
pub use move_nodes::{BarrierUpdateJob, MoveJob, MoveStrategy, NodeSelectionRecipe, PickLayerJob, SelectionMode};
pub use move_selection::MoveSelectionStrategy;
pub use undo_command::UndoCommandStrategy;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    device::{PaintDevice, Transaction},
    node::Node,
    strokes::{StrokeError, UndoBridge},
    undo::{UndoStack, UpdateCommand},
    updates::UpdatesHandle,
    util::Rect,
};

/// Shared part of strokes painting into one layer: everything painted between init and finish is
/// recorded by a single device transaction.
struct PainterBase {
    node: Arc<Node>,
    device: Arc<PaintDevice>,
    transaction: Mutex<Option<Transaction>>,
    bridge: UndoBridge,
    updates: UpdatesHandle,
}
impl PainterBase {
    /// `None` if `node` has no pixels to paint on.
    fn new(name: &str, node: Arc<Node>, stack: Arc<UndoStack>, updates: UpdatesHandle) -> Option<Self> {
        let device = node.device()?.clone();
        Some(Self {
            node,
            device,
            transaction: Mutex::new(None),
            bridge: UndoBridge::new(name, stack),
            updates,
        })
    }
    fn begin(&self) {
        *self.transaction.lock() = Some(self.device.transaction(self.bridge.name()));
    }
    fn refresh(&self, rect: Rect) {
        self.updates.refresh(&self.node, rect);
    }
    fn finish(&self) -> Result<(), StrokeError> {
        let transaction = self.transaction.lock().take();
        if let Some(transaction) = transaction {
            let command = transaction.commit()?;
            if !command.is_empty() {
                let rect = command.dirty_rect();
                self.bridge.notify_command_done(Box::new(UpdateCommand::new(
                    self.node.clone(),
                    rect,
                    self.updates.clone(),
                    Box::new(command),
                )));
            }
        }
        Ok(self.bridge.finish()?)
    }
    fn cancel(&self) -> Result<(), StrokeError> {
        let transaction = self.transaction.lock().take();
        if let Some(transaction) = transaction {
            let rect = transaction.revert()?;
            self.refresh(rect);
        }
        Ok(self.bridge.cancel()?)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{collections::VecDeque, sync::Arc};

    use crate::strokes::{CancellationToken, Job, JobContext, StrokeId, StrokeJobData, StrokeStrategy};

    /// Drives a strategy on the calling thread, one job at a time, running jobs it queues
    /// before the next one.
    pub(crate) struct InlineStroke {
        strategy: Arc<dyn StrokeStrategy>,
        id: StrokeId,
        lod: u32,
        cancellation: CancellationToken,
    }
    impl InlineStroke {
        pub(crate) fn start(strategy: Arc<dyn StrokeStrategy>) -> Self {
            Self::start_at(strategy, 0)
        }
        pub(crate) fn start_at(strategy: Arc<dyn StrokeStrategy>, lod: u32) -> Self {
            let stroke = Self {
                strategy,
                id: StrokeId::new(),
                lod,
                cancellation: CancellationToken::default(),
            };
            stroke.run(Job::init(stroke.strategy.init_exclusivity()));
            stroke
        }
        pub(crate) fn job(&self, data: Box<dyn StrokeJobData>) {
            self.run(Job::data(data));
        }
        pub(crate) fn finish(self) {
            self.run(Job::finish(self.strategy.finish_exclusivity()));
        }
        pub(crate) fn cancel(self) {
            self.cancellation.cancel();
            self.run(Job::cancel(self.strategy.cancel_exclusivity()));
        }
        fn run(&self, job: Job) {
            let mut pending = VecDeque::from([job]);
            while let Some(job) = pending.pop_front() {
                let ctx = JobContext::new(self.id, self.lod, self.cancellation.clone());
                job.execute(&*self.strategy, &ctx).unwrap();
                for mutated in ctx.take_mutated().into_iter().rev() {
                    pending.push_front(mutated);
                }
            }
        }
    }
}
