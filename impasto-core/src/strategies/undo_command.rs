use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    strokes::{Exclusivity, JobContext, StrokeError, StrokeJobData, StrokeStrategy, UndoBridge},
    undo::{UndoCommand, UndoError, UndoStack},
};

enum Action {
    Undo,
    Redo,
    /// Run a new command and record it.
    Execute(Mutex<Option<Box<dyn UndoCommand>>>),
}

/// Walks the history, or runs one command, as a stroke of its own, so that it's ordered with
/// the strokes around it. Runs alone on the image.
pub struct UndoCommandStrategy {
    stack: Arc<UndoStack>,
    action: Action,
    bridge: UndoBridge,
    /// Whether the history step was taken, and needs reversing on cancel.
    stepped: AtomicBool,
}
impl UndoCommandStrategy {
    fn with_action(action: Action, name: &str, stack: Arc<UndoStack>) -> Self {
        Self {
            bridge: UndoBridge::new(name, stack.clone()),
            stack,
            action,
            stepped: AtomicBool::new(false),
        }
    }
    #[must_use]
    pub fn undo(stack: Arc<UndoStack>) -> Self {
        Self::with_action(Action::Undo, "Undo", stack)
    }
    #[must_use]
    pub fn redo(stack: Arc<UndoStack>) -> Self {
        Self::with_action(Action::Redo, "Redo", stack)
    }
    #[must_use]
    pub fn execute(command: Box<dyn UndoCommand>, stack: Arc<UndoStack>) -> Self {
        let name = command.text().to_owned();
        Self::with_action(Action::Execute(Mutex::new(Some(command))), &name, stack)
    }
}
impl StrokeStrategy for UndoCommandStrategy {
    fn name(&self) -> &str {
        match self.action {
            Action::Undo => "undo",
            Action::Redo => "redo",
            Action::Execute(_) => "command",
        }
    }
    fn init_exclusivity(&self) -> Exclusivity {
        Exclusivity::Exclusive
    }
    fn init(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        let stepped = match &self.action {
            Action::Undo => self.stack.undo(),
            Action::Redo => self.stack.redo(),
            Action::Execute(command) => {
                if let Some(command) = command.lock().take() {
                    self.bridge.run_and_save_command(command)?;
                }
                return Ok(());
            }
        };
        match stepped {
            Ok(text) => {
                log::debug!("{}: {text}", self.name());
                self.stepped.store(true, Ordering::Release);
                Ok(())
            }
            Err(UndoError::NothingToUndo | UndoError::NothingToRedo) => {
                log::debug!("{}: history exhausted", self.name());
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
    fn do_job(&self, _ctx: &JobContext, data: Box<dyn StrokeJobData>) -> Result<(), StrokeError> {
        log::warn!("{} stroke takes no jobs, got {data:?}", self.name());
        Ok(())
    }
    fn finish(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        Ok(self.bridge.finish()?)
    }
    fn cancel(&self, _ctx: &JobContext) -> Result<(), StrokeError> {
        if self.stepped.swap(false, Ordering::AcqRel) {
            match self.action {
                Action::Undo => {
                    self.stack.redo()?;
                }
                Action::Redo => {
                    self.stack.undo()?;
                }
                Action::Execute(_) => (),
            }
        }
        Ok(self.bridge.cancel()?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        device::PaintDevice, node::Node, strategies::test_support::InlineStroke, undo::NodeMoveCommand,
        util::Point,
    };

    fn moved_layer(stack: &Arc<UndoStack>) -> Arc<Node> {
        let node = Node::new_paint_layer("layer", Arc::new(PaintDevice::new(16, &[0], None).unwrap()));
        let command = NodeMoveCommand::new(node.clone(), Point::ZERO, Point::new(4, 4));
        let stroke = InlineStroke::start(Arc::new(UndoCommandStrategy::execute(Box::new(command), stack.clone())));
        stroke.finish();
        node
    }

    #[test]
    fn execute_then_undo_redo() {
        let stack = Arc::new(UndoStack::new());
        let node = moved_layer(&stack);
        assert_eq!(node.offset(), Point::new(4, 4));
        assert_eq!(stack.depth(), 1);

        InlineStroke::start(Arc::new(UndoCommandStrategy::undo(stack.clone()))).finish();
        assert_eq!(node.offset(), Point::ZERO);
        InlineStroke::start(Arc::new(UndoCommandStrategy::redo(stack.clone()))).finish();
        assert_eq!(node.offset(), Point::new(4, 4));
        // Redo with nothing left is a no-op.
        InlineStroke::start(Arc::new(UndoCommandStrategy::redo(stack.clone()))).finish();
        assert_eq!(node.offset(), Point::new(4, 4));
    }
    #[test]
    fn cancelled_undo_steps_back() {
        let stack = Arc::new(UndoStack::new());
        let node = moved_layer(&stack);
        InlineStroke::start(Arc::new(UndoCommandStrategy::undo(stack.clone()))).cancel();
        assert_eq!(node.offset(), Point::new(4, 4));
        assert!(stack.can_undo());
    }
    #[test]
    fn cancelled_execute_reverts() {
        let stack = Arc::new(UndoStack::new());
        let node = Node::new_paint_layer("layer", Arc::new(PaintDevice::new(16, &[0], None).unwrap()));
        let command = NodeMoveCommand::new(node.clone(), Point::ZERO, Point::new(4, 4));
        InlineStroke::start(Arc::new(UndoCommandStrategy::execute(Box::new(command), stack.clone()))).cancel();
        assert_eq!(node.offset(), Point::ZERO);
        assert!(!stack.can_undo());
    }
}
