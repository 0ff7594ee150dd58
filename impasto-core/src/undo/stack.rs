use parking_lot::Mutex;

use super::{DoUndo, UndoCommand, UndoError};

enum Entry {
    // Root of the history tree, representing the state before any command.
    Root,
    Command(Box<dyn UndoCommand>),
}

struct History {
    /// Undoing then doing something new creates a branch. The last child of a node
    /// is always the most recent, and is what redo follows.
    tree: slab_tree::Tree<Entry>,
    root: slab_tree::NodeId,
    /// Most recently applied command, or the root.
    present: slab_tree::NodeId,
    /// Where the document was last marked clean (eg. saved), if that point still exists.
    clean: Option<slab_tree::NodeId>,
}
impl History {
    fn command(&self, id: slab_tree::NodeId) -> Option<&dyn UndoCommand> {
        match self.tree.get(id)?.data() {
            Entry::Command(command) => Some(&**command),
            Entry::Root => None,
        }
    }
}

/// Thread-safe undo history.
pub struct UndoStack {
    inner: Mutex<History>,
}
impl Default for UndoStack {
    fn default() -> Self {
        let tree = slab_tree::TreeBuilder::new().with_root(Entry::Root).build();
        // Built with a root just above.
        let root = tree.root_id().unwrap();
        Self {
            inner: Mutex::new(History {
                tree,
                root,
                present: root,
                clean: Some(root),
            }),
        }
    }
}
impl UndoStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// Record a command that has already been done. It is merged into the previous entry when
    /// both share a macro id, the previous entry has not been undone past, and it accepts the merge.
    pub fn push(&self, command: Box<dyn UndoCommand>) {
        let mut lock = self.inner.lock();
        let History {
            tree,
            present,
            clean,
            ..
        } = &mut *lock;
        let merged = command.macro_id().is_some()
            && *clean != Some(*present)
            && tree.get_mut(*present).is_some_and(|mut node| {
                let can_merge = node.as_ref().first_child().is_none();
                match node.data() {
                    Entry::Command(previous) if can_merge && previous.macro_id() == command.macro_id() => {
                        previous.merge_with(&*command)
                    }
                    _ => false,
                }
            });
        if merged {
            log::trace!("merged \"{}\" into previous history entry", command.text());
            return;
        }
        log::trace!("recording \"{}\"", command.text());
        let Some(mut node) = tree.get_mut(*present) else {
            log::error!("history cursor missing, dropping \"{}\"", command.text());
            return;
        };
        *present = node.append(Entry::Command(command)).node_id();
    }
    /// Revert the most recent command. Returns its text.
    pub fn undo(&self) -> Result<String, UndoError> {
        let mut lock = self.inner.lock();
        let present = lock.present;
        let command = lock.command(present).ok_or(UndoError::NothingToUndo)?;
        command.apply(DoUndo::Undo)?;
        let text = command.text().to_owned();
        let parent = lock
            .tree
            .get(present)
            .and_then(|node| node.parent().map(|parent| parent.node_id()));
        lock.present = parent.unwrap_or(lock.root);
        log::debug!("undid \"{text}\"");
        Ok(text)
    }
    /// Re-apply the most recently undone command. Returns its text.
    pub fn redo(&self) -> Result<String, UndoError> {
        let mut lock = self.inner.lock();
        let next = lock
            .tree
            .get(lock.present)
            .and_then(|node| node.last_child().map(|child| child.node_id()))
            .ok_or(UndoError::NothingToRedo)?;
        let command = lock.command(next).ok_or(UndoError::NothingToRedo)?;
        command.apply(DoUndo::Do)?;
        let text = command.text().to_owned();
        lock.present = next;
        log::debug!("redid \"{text}\"");
        Ok(text)
    }
    /// Undo up to `count` commands, returning how many were undone.
    pub fn undo_n(&self, count: usize) -> Result<usize, UndoError> {
        for done in 0..count {
            match self.undo() {
                Ok(_) => (),
                Err(UndoError::NothingToUndo) => return Ok(done),
                Err(err) => return Err(err),
            }
        }
        Ok(count)
    }
    /// Redo up to `count` commands, returning how many were redone.
    pub fn redo_n(&self, count: usize) -> Result<usize, UndoError> {
        for done in 0..count {
            match self.redo() {
                Ok(_) => (),
                Err(UndoError::NothingToRedo) => return Ok(done),
                Err(err) => return Err(err),
            }
        }
        Ok(count)
    }
    #[must_use]
    pub fn can_undo(&self) -> bool {
        let lock = self.inner.lock();
        lock.present != lock.root
    }
    #[must_use]
    pub fn can_redo(&self) -> bool {
        let lock = self.inner.lock();
        lock.tree
            .get(lock.present)
            .is_some_and(|node| node.last_child().is_some())
    }
    #[must_use]
    pub fn undo_text(&self) -> Option<String> {
        let lock = self.inner.lock();
        lock.command(lock.present).map(|command| command.text().to_owned())
    }
    /// Commands between the root and the present.
    #[must_use]
    pub fn depth(&self) -> usize {
        let lock = self.inner.lock();
        lock.tree
            .get(lock.present)
            .map_or(0, |node| node.ancestors().count())
    }
    /// Mark the present as matching what's on disk.
    pub fn mark_clean(&self) {
        let mut lock = self.inner.lock();
        lock.clean = Some(lock.present);
    }
    #[must_use]
    pub fn is_clean(&self) -> bool {
        let lock = self.inner.lock();
        lock.clean == Some(lock.present)
    }
}
impl std::fmt::Debug for UndoStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoStack")
            .field("depth", &self.depth())
            .field("can_redo", &self.can_redo())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    };

    use super::UndoStack;
    use crate::undo::{DoUndo, MacroId, UndoCommand, UndoError};

    /// Adds `amount` to a shared counter.
    #[derive(Debug)]
    struct Add {
        target: Arc<AtomicI32>,
        amount: i32,
        merge: Option<MacroId>,
    }
    impl Add {
        fn run(target: &Arc<AtomicI32>, amount: i32, merge: Option<MacroId>) -> Box<Self> {
            target.fetch_add(amount, Ordering::SeqCst);
            Box::new(Self {
                target: target.clone(),
                amount,
                merge,
            })
        }
    }
    impl UndoCommand for Add {
        fn text(&self) -> &str {
            "add"
        }
        fn apply(&self, direction: DoUndo) -> Result<(), UndoError> {
            let delta = match direction {
                DoUndo::Do => self.amount,
                DoUndo::Undo => -self.amount,
            };
            self.target.fetch_add(delta, Ordering::SeqCst);
            Ok(())
        }
        fn macro_id(&self) -> Option<MacroId> {
            self.merge
        }
        fn merge_with(&mut self, later: &dyn UndoCommand) -> bool {
            match later.as_any().downcast_ref::<Self>() {
                Some(later) if Arc::ptr_eq(&self.target, &later.target) => {
                    self.amount += later.amount;
                    true
                }
                _ => false,
            }
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn undo_redo_linear() {
        let value = Arc::new(AtomicI32::new(0));
        let stack = UndoStack::new();
        stack.push(Add::run(&value, 1, None));
        stack.push(Add::run(&value, 10, None));
        assert_eq!(value.load(Ordering::SeqCst), 11);
        assert_eq!(stack.depth(), 2);

        stack.undo().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 1);
        stack.undo().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 0);
        assert!(matches!(stack.undo(), Err(UndoError::NothingToUndo)));

        assert_eq!(stack.redo_n(5).unwrap(), 2);
        assert_eq!(value.load(Ordering::SeqCst), 11);
        assert!(!stack.can_redo());
    }
    #[test]
    fn new_command_after_undo_branches() {
        let value = Arc::new(AtomicI32::new(0));
        let stack = UndoStack::new();
        stack.push(Add::run(&value, 1, None));
        stack.push(Add::run(&value, 2, None));
        stack.undo().unwrap();
        stack.push(Add::run(&value, 100, None));
        assert_eq!(value.load(Ordering::SeqCst), 101);
        // Redo follows the newest branch, and there's nothing past it.
        assert!(!stack.can_redo());
        stack.undo().unwrap();
        assert!(stack.can_redo());
        stack.redo().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 101);
    }
    #[test]
    fn merging() {
        let value = Arc::new(AtomicI32::new(0));
        let stack = UndoStack::new();
        stack.push(Add::run(&value, 1, Some(MacroId::MOVE)));
        stack.push(Add::run(&value, 2, Some(MacroId::MOVE)));
        stack.push(Add::run(&value, 3, Some(MacroId::MOVE_SELECTION)));
        assert_eq!(stack.depth(), 2);
        stack.undo_n(2).unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 0);
    }
    #[test]
    fn no_merge_across_clean_point() {
        let value = Arc::new(AtomicI32::new(0));
        let stack = UndoStack::new();
        stack.push(Add::run(&value, 1, Some(MacroId::MOVE)));
        stack.mark_clean();
        assert!(stack.is_clean());
        stack.push(Add::run(&value, 2, Some(MacroId::MOVE)));
        assert_eq!(stack.depth(), 2);
        assert!(!stack.is_clean());
        stack.undo().unwrap();
        assert!(stack.is_clean());
    }
}
