//! # Node graph
//! The image is a tree of [`Node`]s. Groups hold children, paint layers hold a [`PaintDevice`].
//! Children are ordered bottom to top: the last child is composited last.
//!
//! Nodes are shared as `Arc<Node>` between the image, strokes and undo commands. Parents are
//! referenced weakly.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::{
    device::{DeviceError, PaintDevice},
    id::UniqueId,
    lod::PlanarOffset,
    util::{Point, Rect},
};

pub type NodeId = UniqueId<Node>;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u32 {
        const VISIBLE = 1;
        /// Content can't be edited. Moves skip it.
        const LOCKED = 1 << 1;
        /// The node can be moved on a reduced resolution preview plane.
        const SUPPORTS_LOD_MOVES = 1 << 2;
    }
}
impl Default for NodeFlags {
    fn default() -> Self {
        Self::VISIBLE | Self::SUPPORTS_LOD_MOVES
    }
}

#[derive(Clone, Debug, strum::AsRefStr)]
pub enum NodeKind {
    Group,
    PaintLayer(Arc<PaintDevice>),
}

/// Device composited on top of a paint layer, in place of painting into it directly.
/// Strokes use it to show a result before merging it into the layer.
#[derive(Clone, Debug)]
pub struct TemporaryTarget {
    pub device: Arc<PaintDevice>,
    pub opacity: u8,
}

pub struct Node {
    id: NodeId,
    name: String,
    kind: NodeKind,
    flags: RwLock<NodeFlags>,
    /// Group position. Paint layers are positioned by their device.
    offset: Mutex<PlanarOffset>,
    parent: RwLock<Weak<Node>>,
    children: RwLock<Vec<Arc<Node>>>,
    temporary: Mutex<Option<TemporaryTarget>>,
}
impl Node {
    fn with_kind(name: impl Into<String>, kind: NodeKind) -> Arc<Self> {
        Arc::new(Self {
            id: NodeId::new(),
            name: name.into(),
            kind,
            flags: RwLock::new(NodeFlags::default()),
            offset: Mutex::new(PlanarOffset::default()),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
            temporary: Mutex::new(None),
        })
    }
    #[must_use]
    pub fn new_group(name: impl Into<String>) -> Arc<Self> {
        Self::with_kind(name, NodeKind::Group)
    }
    #[must_use]
    pub fn new_paint_layer(name: impl Into<String>, device: Arc<PaintDevice>) -> Arc<Self> {
        Self::with_kind(name, NodeKind::PaintLayer(device))
    }
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }
    #[must_use]
    pub fn device(&self) -> Option<&Arc<PaintDevice>> {
        match &self.kind {
            NodeKind::PaintLayer(device) => Some(device),
            NodeKind::Group => None,
        }
    }

    #[must_use]
    pub fn flags(&self) -> NodeFlags {
        *self.flags.read()
    }
    pub fn set_flags(&self, flags: NodeFlags, enabled: bool) {
        self.flags.write().set(flags, enabled);
    }
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.flags().contains(NodeFlags::VISIBLE)
    }
    #[must_use]
    pub fn supports_lod_moves(&self) -> bool {
        self.flags().contains(NodeFlags::SUPPORTS_LOD_MOVES)
    }
    /// Unlocked and visible. With `check_ancestors`, every ancestor must be too.
    #[must_use]
    pub fn is_editable(&self, check_ancestors: bool) -> bool {
        let flags = self.flags();
        let own = flags.contains(NodeFlags::VISIBLE) && !flags.contains(NodeFlags::LOCKED);
        if !own || !check_ancestors {
            return own;
        }
        self.parent().map_or(true, |parent| parent.is_editable(true))
    }

    /// Append as the topmost child. A node already placed elsewhere is moved.
    pub fn add_child(self: &Arc<Self>, child: Arc<Node>) {
        if let Some(old) = child.parent() {
            old.remove_child(child.id);
        }
        *child.parent.write() = Arc::downgrade(self);
        self.children.write().push(child);
    }
    pub fn remove_child(&self, id: NodeId) -> Option<Arc<Node>> {
        let mut children = self.children.write();
        let idx = children.iter().position(|child| child.id == id)?;
        let child = children.remove(idx);
        *child.parent.write() = Weak::new();
        Some(child)
    }
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.read().upgrade()
    }
    /// Snapshot of the children, bottom to top.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<Node>> {
        self.children.read().clone()
    }
    #[must_use]
    pub fn first_child(&self) -> Option<Arc<Node>> {
        self.children.read().first().cloned()
    }
    #[must_use]
    pub fn next_sibling(&self) -> Option<Arc<Node>> {
        let parent = self.parent()?;
        let siblings = parent.children.read();
        let idx = siblings.iter().position(|sibling| sibling.id == self.id)?;
        siblings.get(idx + 1).cloned()
    }
    /// This node followed by every descendant, depth first, bottom to top.
    #[must_use]
    pub fn subtree(self: &Arc<Self>) -> Vec<Arc<Node>> {
        let mut out = vec![self.clone()];
        let mut idx = 0;
        while idx < out.len() {
            let children = out[idx].children();
            let insert_at = idx + 1;
            out.splice(insert_at..insert_at, children);
            idx += 1;
        }
        out
    }
    /// Whether `self` is `ancestor` or lies beneath it.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Node) -> bool {
        if self.id == ancestor.id {
            return true;
        }
        self.parent().is_some_and(|parent| parent.is_descendant_of(ancestor))
    }

    #[must_use]
    pub fn offset(&self) -> Point {
        self.offset_at(0)
    }
    #[must_use]
    pub fn x(&self) -> i32 {
        self.offset().x
    }
    #[must_use]
    pub fn y(&self) -> i32 {
        self.offset().y
    }
    pub fn set_offset(&self, offset: Point) {
        self.set_offset_at(0, offset);
    }
    /// Position on the plane of LOD `level`, zero being the image itself.
    #[must_use]
    pub fn offset_at(&self, level: u32) -> Point {
        match &self.kind {
            NodeKind::PaintLayer(device) => device.offset_at(level),
            NodeKind::Group => self.offset.lock().get(level),
        }
    }
    pub fn set_offset_at(&self, level: u32, offset: Point) {
        match &self.kind {
            NodeKind::PaintLayer(device) => device.set_offset_at(level, offset),
            NodeKind::Group => self.offset.lock().set(level, offset),
        }
    }
    pub fn sync_lod_plane(&self, level: u32) {
        match &self.kind {
            NodeKind::PaintLayer(device) => device.sync_lod_plane(level),
            NodeKind::Group => self.offset.lock().sync(level),
        }
        if let Some(target) = self.temporary_target() {
            target.device.sync_lod_plane(level);
        }
    }

    #[must_use]
    pub fn temporary_target(&self) -> Option<TemporaryTarget> {
        self.temporary.lock().clone()
    }
    pub fn set_temporary_target(&self, target: Option<TemporaryTarget>) {
        *self.temporary.lock() = target;
    }
    #[must_use]
    pub fn take_temporary_target(&self) -> Option<TemporaryTarget> {
        self.temporary.lock().take()
    }

    /// Bounds of what this node shows on its own: the non-default pixels of its device
    /// plus its temporary target. Groups show nothing on their own.
    pub fn tight_visible_bounds(&self) -> Result<Rect, DeviceError> {
        let own = match self.device() {
            Some(device) => device.exact_bounds()?,
            None => Rect::EMPTY,
        };
        let temporary = match self.temporary_target() {
            Some(target) => target.device.exact_bounds()?,
            None => Rect::EMPTY,
        };
        Ok(own | temporary)
    }
    /// [`Node::tight_visible_bounds`] of the whole subtree.
    pub fn subtree_bounds(self: &Arc<Self>) -> Result<Rect, DeviceError> {
        self.subtree()
            .iter()
            .try_fold(Rect::EMPTY, |acc, node| Ok(acc | node.tight_visible_bounds()?))
    }
}
impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind.as_ref())
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}
