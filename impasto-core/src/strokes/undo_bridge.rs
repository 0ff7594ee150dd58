use std::sync::Arc;

use parking_lot::Mutex;

use crate::undo::{DoUndo, MacroCommand, MacroId, UndoCommand, UndoError, UndoStack};

/// Collects the commands a stroke executes and records them as one history entry when the
/// stroke finishes, or reverts them when it's cancelled.
///
/// A detached bridge, as used by preview strokes, reverts like any other but never records.
pub struct UndoBridge {
    name: String,
    stack: Option<Arc<UndoStack>>,
    macro_id: Option<MacroId>,
    init_command: Mutex<Option<Box<dyn UndoCommand>>>,
    finish_command: Mutex<Option<Box<dyn UndoCommand>>>,
    executed: Mutex<Vec<Box<dyn UndoCommand>>>,
}
impl UndoBridge {
    #[must_use]
    pub fn new(name: impl Into<String>, stack: Arc<UndoStack>) -> Self {
        Self::with_stack(name.into(), Some(stack))
    }
    #[must_use]
    pub fn detached(name: impl Into<String>) -> Self {
        Self::with_stack(name.into(), None)
    }
    fn with_stack(name: String, stack: Option<Arc<UndoStack>>) -> Self {
        Self {
            name,
            stack,
            macro_id: None,
            init_command: Mutex::new(None),
            finish_command: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
        }
    }
    #[must_use]
    pub fn with_macro_id(mut self, macro_id: MacroId) -> Self {
        self.macro_id = Some(macro_id);
        self
    }
    /// Detached twin for a preview of the same stroke.
    #[must_use]
    pub fn lod_clone(&self) -> Self {
        Self {
            macro_id: self.macro_id,
            ..Self::detached(self.name.clone())
        }
    }
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.stack.is_none()
    }
    /// Command to execute when the stroke initializes.
    pub fn set_init_command(&self, command: Box<dyn UndoCommand>) {
        *self.init_command.lock() = Some(command);
    }
    /// Command to execute when the stroke finishes, after every other.
    pub fn set_finish_command(&self, command: Box<dyn UndoCommand>) {
        *self.finish_command.lock() = Some(command);
    }

    pub fn init(&self) -> Result<(), UndoError> {
        let command = self.init_command.lock().take();
        match command {
            Some(command) => self.run_and_save_command(command),
            None => Ok(()),
        }
    }
    /// Do `command` and keep it for the history entry.
    pub fn run_and_save_command(&self, command: Box<dyn UndoCommand>) -> Result<(), UndoError> {
        command.apply(DoUndo::Do)?;
        self.notify_command_done(command);
        Ok(())
    }
    /// Keep a command that's already been done.
    pub fn notify_command_done(&self, command: Box<dyn UndoCommand>) {
        log::trace!("{}: executed {}", self.name, command.text());
        self.executed.lock().push(command);
    }
    #[must_use]
    pub fn executed_count(&self) -> usize {
        self.executed.lock().len()
    }
    /// Record everything executed as one entry. Nothing is recorded for a stroke that didn't
    /// change anything.
    pub fn finish(&self) -> Result<(), UndoError> {
        let command = self.finish_command.lock().take();
        if let Some(command) = command {
            self.run_and_save_command(command)?;
        }
        let executed = std::mem::take(&mut *self.executed.lock());
        if executed.is_empty() {
            return Ok(());
        }
        match &self.stack {
            Some(stack) => {
                log::debug!("{}: recording {} commands", self.name, executed.len());
                stack.push(Box::new(MacroCommand::new(
                    self.name.clone(),
                    executed,
                    self.macro_id,
                )));
            }
            None => log::trace!("{}: detached, {} commands dropped", self.name, executed.len()),
        }
        Ok(())
    }
    /// Undo everything executed, newest first.
    pub fn cancel(&self) -> Result<(), UndoError> {
        let executed = std::mem::take(&mut *self.executed.lock());
        log::debug!("{}: reverting {} commands", self.name, executed.len());
        executed
            .iter()
            .rev()
            .try_for_each(|command| command.apply(DoUndo::Undo))
    }
}
impl std::fmt::Debug for UndoBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoBridge")
            .field("name", &self.name)
            .field("detached", &self.is_detached())
            .field("macro_id", &self.macro_id)
            .field("executed", &self.executed_count())
            .finish()
    }
}
