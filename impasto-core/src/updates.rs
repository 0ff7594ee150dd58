//! Canvas update requests from strokes and commands.

use std::sync::{Arc, Weak};

use crate::{node::Node, util::Rect};

/// Whatever keeps the rendered image in sync with the node graph.
pub trait UpdatesFacade: Send + Sync {
    /// Queue a recomposite of `rect` (image coordinates) after `node` changed.
    fn refresh_graph_async(&self, node: &Arc<Node>, rect: Rect);
    /// Whether queued recomposites haven't completed yet.
    fn has_updates_running(&self) -> bool;
    /// Hold back recomposites until a matching unblock. Nests.
    fn block_updates(&self);
    fn unblock_updates(&self);
}

/// Non-owning handle to an [`UpdatesFacade`]. Requests made after the facade is gone are dropped.
#[derive(Clone)]
pub struct UpdatesHandle(Weak<dyn UpdatesFacade>);
impl UpdatesHandle {
    #[must_use]
    pub fn new<U: UpdatesFacade + 'static>(updates: &Arc<U>) -> Self {
        let weak: Weak<U> = Arc::downgrade(updates);
        Self(weak)
    }
    #[must_use]
    pub fn from_weak(updates: Weak<dyn UpdatesFacade>) -> Self {
        Self(updates)
    }
    pub fn refresh(&self, node: &Arc<Node>, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        if let Some(updates) = self.0.upgrade() {
            updates.refresh_graph_async(node, rect);
        }
    }
    #[must_use]
    pub fn has_updates_running(&self) -> bool {
        self.0.upgrade().is_some_and(|updates| updates.has_updates_running())
    }
    pub fn block(&self) {
        if let Some(updates) = self.0.upgrade() {
            updates.block_updates();
        }
    }
    pub fn unblock(&self) {
        if let Some(updates) = self.0.upgrade() {
            updates.unblock_updates();
        }
    }
}
impl std::fmt::Debug for UpdatesHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UpdatesHandle")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{UpdatesFacade, UpdatesHandle};
    use crate::{node::Node, node::NodeId, util::Rect};

    /// Facade that only records what was asked of it.
    #[derive(Default)]
    pub(crate) struct RecordingUpdates {
        pub refreshed: Mutex<Vec<(NodeId, Rect)>>,
        pub blocked: Mutex<i32>,
    }
    impl RecordingUpdates {
        pub(crate) fn handle(self: &Arc<Self>) -> UpdatesHandle {
            UpdatesHandle::new(self)
        }
        pub(crate) fn refresh_count(&self) -> usize {
            self.refreshed.lock().len()
        }
    }
    impl UpdatesFacade for RecordingUpdates {
        fn refresh_graph_async(&self, node: &Arc<Node>, rect: Rect) {
            self.refreshed.lock().push((node.id(), rect));
        }
        fn has_updates_running(&self) -> bool {
            false
        }
        fn block_updates(&self) {
            *self.blocked.lock() += 1;
        }
        fn unblock_updates(&self) {
            *self.blocked.lock() -= 1;
        }
    }
}
