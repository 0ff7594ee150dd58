use std::sync::Arc;

use super::{DoUndo, MacroId, UndoCommand, UndoError};
use crate::{
    node::Node,
    selection::Selection,
    updates::UpdatesHandle,
    util::{Point, Rect},
};

/// Ordered group of commands, undone in reverse.
#[derive(Debug)]
pub struct MacroCommand {
    text: String,
    children: Vec<Box<dyn UndoCommand>>,
    macro_id: Option<MacroId>,
}
impl MacroCommand {
    #[must_use]
    pub fn new(text: impl Into<String>, children: Vec<Box<dyn UndoCommand>>, macro_id: Option<MacroId>) -> Self {
        Self {
            text: text.into(),
            children,
            macro_id,
        }
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}
impl UndoCommand for MacroCommand {
    fn text(&self) -> &str {
        &self.text
    }
    fn apply(&self, direction: DoUndo) -> Result<(), UndoError> {
        match direction {
            DoUndo::Do => self.children.iter().try_for_each(|child| child.apply(direction)),
            DoUndo::Undo => self.children.iter().rev().try_for_each(|child| child.apply(direction)),
        }
    }
    fn macro_id(&self) -> Option<MacroId> {
        self.macro_id
    }
    fn can_merge_with(&self, later: &dyn UndoCommand) -> bool {
        let Some(later) = later.as_any().downcast_ref::<Self>() else {
            return false;
        };
        self.macro_id.is_some()
            && self.macro_id == later.macro_id
            && self.children.len() == later.children.len()
            && self
                .children
                .iter()
                .zip(&later.children)
                .all(|(ours, theirs)| ours.can_merge_with(&**theirs))
    }
    fn merge_with(&mut self, later: &dyn UndoCommand) -> bool {
        if !self.can_merge_with(later) {
            return false;
        }
        let Some(later) = later.as_any().downcast_ref::<Self>() else {
            return false;
        };
        for (ours, theirs) in self.children.iter_mut().zip(&later.children) {
            ours.merge_with(&**theirs);
        }
        true
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Change of a node's image position.
#[derive(Debug)]
pub struct NodeMoveCommand {
    node: Arc<Node>,
    from: Point,
    to: Point,
}
impl NodeMoveCommand {
    #[must_use]
    pub fn new(node: Arc<Node>, from: Point, to: Point) -> Self {
        Self { node, from, to }
    }
}
impl UndoCommand for NodeMoveCommand {
    fn text(&self) -> &str {
        "Move Layer"
    }
    fn apply(&self, direction: DoUndo) -> Result<(), UndoError> {
        let target = match direction {
            DoUndo::Do => self.to,
            DoUndo::Undo => self.from,
        };
        self.node.set_offset(target);
        Ok(())
    }
    fn macro_id(&self) -> Option<MacroId> {
        Some(MacroId::MOVE)
    }
    fn can_merge_with(&self, later: &dyn UndoCommand) -> bool {
        later
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|later| later.node.id() == self.node.id())
    }
    fn merge_with(&mut self, later: &dyn UndoCommand) -> bool {
        match later.as_any().downcast_ref::<Self>() {
            Some(later) if later.node.id() == self.node.id() => {
                self.to = later.to;
                true
            }
            _ => false,
        }
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Change of a selection's position.
#[derive(Debug)]
pub struct SelectionMoveCommand {
    selection: Arc<Selection>,
    from: Point,
    to: Point,
}
impl SelectionMoveCommand {
    /// Moves the selection to `to`, remembering where it was.
    #[must_use]
    pub fn new(selection: Arc<Selection>, to: Point) -> Self {
        let from = selection.offset();
        Self { selection, from, to }
    }
}
impl UndoCommand for SelectionMoveCommand {
    fn text(&self) -> &str {
        "Move Selection"
    }
    fn apply(&self, direction: DoUndo) -> Result<(), UndoError> {
        self.selection.set_offset(match direction {
            DoUndo::Do => self.to,
            DoUndo::Undo => self.from,
        });
        Ok(())
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Wraps a command so that the canvas under `rect` is refreshed after it's applied in either direction.
#[derive(Debug)]
pub struct UpdateCommand {
    node: Arc<Node>,
    rect: Rect,
    updates: UpdatesHandle,
    inner: Box<dyn UndoCommand>,
}
impl UpdateCommand {
    #[must_use]
    pub fn new(node: Arc<Node>, rect: Rect, updates: UpdatesHandle, inner: Box<dyn UndoCommand>) -> Self {
        Self {
            node,
            rect,
            updates,
            inner,
        }
    }
}
impl UndoCommand for UpdateCommand {
    fn text(&self) -> &str {
        self.inner.text()
    }
    fn apply(&self, direction: DoUndo) -> Result<(), UndoError> {
        self.inner.apply(direction)?;
        self.updates.refresh(&self.node, self.rect);
        Ok(())
    }
    fn macro_id(&self) -> Option<MacroId> {
        self.inner.macro_id()
    }
    fn can_merge_with(&self, later: &dyn UndoCommand) -> bool {
        later.as_any().downcast_ref::<Self>().is_some_and(|later| {
            later.node.id() == self.node.id() && self.inner.can_merge_with(&*later.inner)
        })
    }
    fn merge_with(&mut self, later: &dyn UndoCommand) -> bool {
        let Some(later) = later.as_any().downcast_ref::<Self>() else {
            return false;
        };
        if later.node.id() != self.node.id() || !self.inner.merge_with(&*later.inner) {
            return false;
        }
        self.rect |= later.rect;
        true
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        device::PaintDevice,
        undo::UndoStack,
        updates::test_support::RecordingUpdates,
    };

    fn layer() -> Arc<Node> {
        Node::new_paint_layer("layer", Arc::new(PaintDevice::new(64, &[0; 4], None).unwrap()))
    }
    fn moved(node: &Arc<Node>, updates: &UpdatesHandle, to: Point) -> Box<dyn UndoCommand> {
        let from = node.offset();
        node.set_offset(to);
        let inner = NodeMoveCommand::new(node.clone(), from, to);
        let update = UpdateCommand::new(node.clone(), Rect::new(0, 0, 8, 8), updates.clone(), Box::new(inner));
        Box::new(MacroCommand::new("Move", vec![Box::new(update)], Some(MacroId::MOVE)))
    }

    #[test]
    fn consecutive_moves_merge() {
        let recorder = Arc::new(RecordingUpdates::default());
        let updates = recorder.handle();
        let node = layer();
        let stack = UndoStack::new();
        stack.push(moved(&node, &updates, Point::new(10, 0)));
        stack.push(moved(&node, &updates, Point::new(20, 5)));
        assert_eq!(stack.depth(), 1);

        stack.undo().unwrap();
        assert_eq!(node.offset(), Point::ZERO);
        assert_eq!(recorder.refresh_count(), 1);
        stack.redo().unwrap();
        assert_eq!(node.offset(), Point::new(20, 5));
    }
    #[test]
    fn different_nodes_dont_merge() {
        let updates = Arc::new(RecordingUpdates::default()).handle();
        let (a, b) = (layer(), layer());
        let stack = UndoStack::new();
        stack.push(moved(&a, &updates, Point::new(1, 1)));
        stack.push(moved(&b, &updates, Point::new(2, 2)));
        assert_eq!(stack.depth(), 2);
    }
    #[test]
    fn macro_undoes_in_reverse() {
        let node = layer();
        node.set_offset(Point::new(5, 5));
        let first = NodeMoveCommand::new(node.clone(), Point::ZERO, Point::new(1, 1));
        let second = NodeMoveCommand::new(node.clone(), Point::new(1, 1), Point::new(5, 5));
        let group = MacroCommand::new("moves", vec![Box::new(first), Box::new(second)], None);
        group.apply(DoUndo::Undo).unwrap();
        assert_eq!(node.offset(), Point::ZERO);
        group.apply(DoUndo::Do).unwrap();
        assert_eq!(node.offset(), Point::new(5, 5));
    }
}
