//! # Undo
//!
//! Every undoable change is an [`UndoCommand`]: a value that can re-apply or revert one change
//! it has already made. Strokes gather the commands they execute and hand them to the
//! [`UndoStack`] as a single [`MacroCommand`] once they finish.
//!
//! Commands are stored in a tree, so that undoing and then doing something new branches history
//! instead of discarding it.

mod commands;
mod stack;

pub use commands::{MacroCommand, NodeMoveCommand, SelectionMoveCommand, UpdateCommand};
pub use stack::UndoStack;

use crate::device::DeviceError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum DoUndo {
    Do,
    Undo,
}

/// Commands carrying equal ids may be merged into one history entry, eg. consecutive
/// moves of the same layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MacroId(pub u32);
impl MacroId {
    pub const MOVE: Self = Self(1);
    pub const MOVE_SELECTION: Self = Self(2);
}

#[derive(thiserror::Error, Debug)]
pub enum UndoError {
    #[error("nothing to undo")]
    NothingToUndo,
    #[error("nothing to redo")]
    NothingToRedo,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub trait UndoCommand: Send + Sync + std::fmt::Debug {
    /// Short user-facing description.
    fn text(&self) -> &str;
    /// Re-apply (`Do`) or revert (`Undo`). A command is only ever applied in alternating
    /// directions, starting with `Undo`, as it has already been done when recorded.
    fn apply(&self, direction: DoUndo) -> Result<(), UndoError>;
    fn macro_id(&self) -> Option<MacroId> {
        None
    }
    /// Whether [`UndoCommand::merge_with`] would accept `later`.
    fn can_merge_with(&self, later: &dyn UndoCommand) -> bool {
        let _ = later;
        false
    }
    /// Absorb `later`, which was done right after `self`, so that one undo reverts both.
    /// Returns `false` and leaves `self` untouched if the two can't be combined.
    fn merge_with(&mut self, later: &dyn UndoCommand) -> bool {
        let _ = later;
        false
    }
    fn as_any(&self) -> &dyn std::any::Any;
}
