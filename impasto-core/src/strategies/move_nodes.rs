use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    device::DeviceError,
    lod::LodTransform,
    node::Node,
    strokes::{
        EventSink, Exclusivity, JobContext, Sequentiality, StrokeError, StrokeEvent, StrokeJobData,
        StrokeStrategy, UndoBridge,
    },
    undo::{MacroId, NodeMoveCommand, UndoStack, UpdateCommand},
    updates::UpdatesHandle,
    util::{Point, Rect},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SelectionMode {
    /// Move the nodes given.
    SelectedLayers,
    /// Move the topmost visible layer with a pixel at the pick point.
    FirstLayerUnderCursor,
}

/// How a move stroke finds the nodes it moves.
#[derive(Clone, Debug)]
pub struct NodeSelectionRecipe {
    pub root: Arc<Node>,
    pub selected: Vec<Arc<Node>>,
    pub mode: SelectionMode,
    pub pick_point: Option<Point>,
}
impl NodeSelectionRecipe {
    #[must_use]
    pub fn selected(root: Arc<Node>, selected: Vec<Arc<Node>>) -> Self {
        Self {
            root,
            selected,
            mode: SelectionMode::SelectedLayers,
            pick_point: None,
        }
    }
    #[must_use]
    pub fn pick(root: Arc<Node>, point: Point) -> Self {
        Self {
            root,
            selected: Vec::new(),
            mode: SelectionMode::FirstLayerUnderCursor,
            pick_point: Some(point),
        }
    }
    /// Every node the stroke could end up moving.
    fn candidates(&self) -> Vec<Arc<Node>> {
        match self.mode {
            SelectionMode::SelectedLayers => self.selected.iter().flat_map(Node::subtree).collect(),
            SelectionMode::FirstLayerUnderCursor => self.root.subtree(),
        }
    }
    /// Nodes to move, topmost ancestors only, in tree order.
    pub fn select_nodes(&self) -> Result<Vec<Arc<Node>>, DeviceError> {
        let requested = match (self.mode, self.pick_point) {
            (SelectionMode::FirstLayerUnderCursor, Some(point)) => {
                self.pick_under(point)?.into_iter().collect()
            }
            (SelectionMode::FirstLayerUnderCursor, None) => Vec::new(),
            (SelectionMode::SelectedLayers, _) => self.selected.clone(),
        };
        Ok(sort_and_filter(&self.root, requested))
    }
    fn pick_under(&self, point: Point) -> Result<Option<Arc<Node>>, DeviceError> {
        // Subtree order is bottom to top.
        for node in self.root.subtree().into_iter().rev() {
            let Some(device) = node.device() else {
                continue;
            };
            if !node.is_editable(true) {
                continue;
            }
            if device.pixel(point.x, point.y)? != device.default_pixel() {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }
}

/// Drop nodes covered by another requested node and nodes that can't be edited, then put the
/// rest in tree order. A requested root stands for all of its children.
fn sort_and_filter(root: &Arc<Node>, requested: Vec<Arc<Node>>) -> Vec<Arc<Node>> {
    let requested: Vec<Arc<Node>> = requested
        .into_iter()
        .flat_map(|node| {
            if node.parent().is_none() {
                node.children()
            } else {
                vec![node]
            }
        })
        .collect();
    root.subtree()
        .into_iter()
        .filter(|node| requested.iter().any(|wanted| wanted.id() == node.id()))
        .filter(|node| {
            !requested
                .iter()
                .any(|other| other.id() != node.id() && node.is_descendant_of(other))
        })
        .filter(|node| {
            let editable = node.is_editable(true);
            if !editable {
                log::debug!("{} ({}) can't be edited, not moved", node.id(), node.name());
            }
            editable
        })
        .collect()
}

/// Total offset from where the stroke started.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MoveJob {
    pub offset: Point,
}
impl StrokeJobData for MoveJob {
    fn create_lod_clone(&self, level: u32) -> Option<Box<dyn StrokeJobData>> {
        Some(Box::new(Self {
            offset: LodTransform::new(level).map_point(self.offset),
        }))
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Re-select the nodes to move by picking under `point`. Ignored once anything moved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PickLayerJob {
    pub point: Point,
}
impl StrokeJobData for PickLayerJob {
    fn sequentiality(&self) -> Sequentiality {
        Sequentiality::Barrier
    }
    fn create_lod_clone(&self, _level: u32) -> Option<Box<dyn StrokeJobData>> {
        // Picking reads full resolution pixels either way.
        Some(Box::new(*self))
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Apply the latest postponed offset and refresh the canvas.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BarrierUpdateJob {
    pub force: bool,
}
impl StrokeJobData for BarrierUpdateJob {
    fn sequentiality(&self) -> Sequentiality {
        Sequentiality::Barrier
    }
    fn create_lod_clone(&self, _level: u32) -> Option<Box<dyn StrokeJobData>> {
        Some(Box::new(*self))
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct MovedNode {
    node: Arc<Node>,
    /// Position at the stroke's level of detail when it started.
    initial: Point,
    /// Visible content, relative to the node position, at full resolution.
    local_bounds: Rect,
}

#[derive(Default)]
struct MoveState {
    moved: Vec<MovedNode>,
    final_offset: Point,
    has_postponed: bool,
    last_update: Option<Instant>,
}

/// Moves whole nodes, with their subtrees.
///
/// Offsets arrive faster than the canvas can follow, so canvas updates are throttled: a move
/// only records the offset, and an update is queued at most once per update interval, or
/// whenever the previous one has landed. Finishing always applies the last offset.
pub struct MoveStrategy {
    recipe: NodeSelectionRecipe,
    /// Shared with the LOD twin. Filled by whichever selects first.
    nodes: Arc<Mutex<Option<Vec<Arc<Node>>>>>,
    state: Mutex<MoveState>,
    updates: UpdatesHandle,
    events: EventSink,
    bridge: UndoBridge,
    update_interval: Duration,
    /// Off while a preview drives the canvas.
    updates_enabled: AtomicBool,
}
impl MoveStrategy {
    #[must_use]
    pub fn new(recipe: NodeSelectionRecipe, stack: Arc<UndoStack>, updates: UpdatesHandle, events: EventSink) -> Self {
        Self {
            recipe,
            nodes: Arc::new(Mutex::new(None)),
            state: Mutex::new(MoveState::default()),
            updates,
            events,
            bridge: UndoBridge::new("Move", stack).with_macro_id(MacroId::MOVE),
            update_interval: crate::config::StrokeConfig::default().update_interval(),
            updates_enabled: AtomicBool::new(true),
        }
    }
    /// Minimum time between two canvas updates while moving.
    #[must_use]
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }
    #[must_use]
    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }
    fn updates_enabled(&self) -> bool {
        self.updates_enabled.load(Ordering::Acquire)
    }
    fn emit(&self, event: StrokeEvent) {
        if self.updates_enabled() {
            self.events.emit(event);
        }
    }

    /// Nodes chosen by this stroke or its twin, choosing them if neither did yet.
    fn shared_nodes(&self) -> Result<Vec<Arc<Node>>, StrokeError> {
        let mut shared = self.nodes.lock();
        if let Some(nodes) = &*shared {
            return Ok(nodes.clone());
        }
        let nodes = self.recipe.select_nodes()?;
        if self.recipe.mode == SelectionMode::FirstLayerUnderCursor {
            self.emit(StrokeEvent::LayersPicked(nodes.iter().map(|node| node.id()).collect()));
        }
        *shared = Some(nodes.clone());
        Ok(nodes)
    }
    /// Record starting positions of `nodes` and every descendant.
    fn prepare(&self, ctx: &JobContext, nodes: &[Arc<Node>]) -> Result<(), StrokeError> {
        let mut moved = Vec::new();
        let mut handles = Rect::EMPTY;
        for node in nodes.iter().flat_map(Node::subtree) {
            if !node.is_editable(false) {
                continue;
            }
            let bounds = node.tight_visible_bounds()?;
            handles |= bounds;
            moved.push(MovedNode {
                initial: node.offset_at(ctx.lod()),
                local_bounds: bounds.translated(-node.offset()),
                node,
            });
        }
        {
            let mut state = self.state.lock();
            state.moved = moved;
            state.final_offset = Point::ZERO;
            state.has_postponed = false;
        }
        if nodes.is_empty() {
            log::debug!("move found nothing to move");
            self.emit(StrokeEvent::StartedEmpty);
        } else {
            self.emit(StrokeEvent::HandlesRectCalculated(handles));
        }
        Ok(())
    }

    fn try_post_update_job(&self, ctx: &JobContext, force: bool) {
        let state = self.state.lock();
        if !state.has_postponed {
            return;
        }
        if !force {
            let too_soon = state
                .last_update
                .is_some_and(|last| last.elapsed() < self.update_interval);
            if too_soon || self.updates.has_updates_running() {
                return;
            }
        }
        ctx.add_mutated_job(Box::new(BarrierUpdateJob { force }));
    }
    fn apply_postponed(&self, ctx: &JobContext, force: bool) -> Result<(), StrokeError> {
        let offset = {
            let mut state = self.state.lock();
            if !state.has_postponed {
                return Ok(());
            }
            state.has_postponed = false;
            state.last_update = Some(Instant::now());
            state.final_offset
        };
        self.do_canvas_update(ctx, offset, force);
        Ok(())
    }
    /// Place every node at its start position plus `offset`, on this stroke's plane.
    fn do_canvas_update(&self, ctx: &JobContext, offset: Point, force: bool) {
        let transform = ctx.lod_transform();
        let refresh = force || self.updates_enabled();
        let state = self.state.lock();
        for moved in &state.moved {
            let bounds = transform.map_rect(moved.local_bounds);
            let from = moved.node.offset_at(ctx.lod());
            let to = moved.initial + offset;
            if from == to {
                continue;
            }
            moved.node.set_offset_at(ctx.lod(), to);
            if refresh {
                let dirty = bounds.translated(from) | bounds.translated(to);
                self.updates
                    .refresh(&moved.node, transform.map_rect_inverted(dirty));
            }
        }
    }
}
impl StrokeStrategy for MoveStrategy {
    fn name(&self) -> &str {
        "move"
    }
    fn init(&self, ctx: &JobContext) -> Result<(), StrokeError> {
        let nodes = self.shared_nodes()?;
        self.prepare(ctx, &nodes)
    }
    fn do_job(&self, ctx: &JobContext, data: Box<dyn StrokeJobData>) -> Result<(), StrokeError> {
        if let Some(job) = data.downcast_ref::<MoveJob>() {
            {
                let mut state = self.state.lock();
                state.final_offset = job.offset;
                state.has_postponed = true;
            }
            self.try_post_update_job(ctx, false);
        } else if let Some(job) = data.downcast_ref::<BarrierUpdateJob>() {
            self.apply_postponed(ctx, job.force)?;
        } else if let Some(job) = data.downcast_ref::<PickLayerJob>() {
            if self.state.lock().final_offset != Point::ZERO {
                log::debug!("pick after the move started, ignored");
                return Ok(());
            }
            let nodes = NodeSelectionRecipe::pick(self.recipe.root.clone(), job.point).select_nodes()?;
            self.emit(StrokeEvent::LayersPicked(nodes.iter().map(|node| node.id()).collect()));
            *self.nodes.lock() = Some(nodes.clone());
            self.prepare(ctx, &nodes)?;
        } else {
            log::warn!("move stroke got unexpected job {data:?}");
        }
        Ok(())
    }
    fn finish(&self, ctx: &JobContext) -> Result<(), StrokeError> {
        self.apply_postponed(ctx, true)?;
        if ctx.lod() == 0 {
            // A preview drove the canvas so far, show where things really landed.
            let refresh = !self.updates_enabled();
            let state = self.state.lock();
            for moved in &state.moved {
                let current = moved.node.offset();
                if current == moved.initial {
                    continue;
                }
                let dirty = moved.local_bounds.translated(moved.initial)
                    | moved.local_bounds.translated(current);
                if refresh {
                    self.updates.refresh(&moved.node, dirty);
                }
                let command = NodeMoveCommand::new(moved.node.clone(), moved.initial, current);
                self.bridge.notify_command_done(Box::new(UpdateCommand::new(
                    moved.node.clone(),
                    dirty,
                    self.updates.clone(),
                    Box::new(command),
                )));
            }
        }
        Ok(self.bridge.finish()?)
    }
    fn cancel(&self, ctx: &JobContext) -> Result<(), StrokeError> {
        {
            let mut state = self.state.lock();
            state.final_offset = Point::ZERO;
            state.has_postponed = true;
        }
        self.try_post_update_job(ctx, true);
        Ok(self.bridge.cancel()?)
    }
    fn create_lod_clone(&self, level: u32) -> Option<Arc<dyn StrokeStrategy>> {
        if let Some(node) = self
            .recipe
            .candidates()
            .into_iter()
            .find(|node| !node.supports_lod_moves())
        {
            log::debug!("{} ({}) can't move at LOD {level}", node.id(), node.name());
            return None;
        }
        self.updates_enabled.store(false, Ordering::Release);
        Some(Arc::new(Self {
            recipe: self.recipe.clone(),
            nodes: self.nodes.clone(),
            state: Mutex::new(MoveState::default()),
            updates: self.updates.clone(),
            events: self.events.clone(),
            bridge: self.bridge.lod_clone(),
            update_interval: self.update_interval,
            updates_enabled: AtomicBool::new(true),
        }))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        device::PaintDevice,
        node::NodeFlags,
        strategies::test_support::InlineStroke,
        node::NodeId,
        updates::test_support::RecordingUpdates,
    };

    fn node_ids(nodes: &[Arc<Node>]) -> Vec<NodeId> {
        nodes.iter().map(|node| node.id()).collect()
    }

    fn layer(root: &Arc<Node>, name: &str, content: Rect) -> Arc<Node> {
        let device = Arc::new(PaintDevice::new(64, &[0; 4], None).unwrap());
        device.fill_rect(content, &[255, 0, 0, 255]).unwrap();
        let node = Node::new_paint_layer(name, device);
        root.add_child(node.clone());
        node
    }
    struct Fixture {
        root: Arc<Node>,
        a: Arc<Node>,
        b: Arc<Node>,
        stack: Arc<UndoStack>,
        recorder: Arc<RecordingUpdates>,
    }
    fn fixture() -> Fixture {
        let root = Node::new_group("root");
        let a = layer(&root, "a", Rect::new(0, 0, 10, 10));
        let b = layer(&root, "b", Rect::new(100, 100, 10, 10));
        Fixture {
            root,
            a,
            b,
            stack: Arc::new(UndoStack::new()),
            recorder: Arc::new(RecordingUpdates::default()),
        }
    }
    impl Fixture {
        fn strategy(&self, recipe: NodeSelectionRecipe, events: EventSink) -> Arc<MoveStrategy> {
            Arc::new(
                MoveStrategy::new(recipe, self.stack.clone(), self.recorder.handle(), events)
                    .with_update_interval(Duration::ZERO),
            )
        }
    }

    #[test]
    fn move_and_undo() {
        let f = fixture();
        let (events, received) = EventSink::channel();
        let strategy = f.strategy(NodeSelectionRecipe::selected(f.root.clone(), vec![f.a.clone()]), events);
        let stroke = InlineStroke::start(strategy);
        stroke.job(Box::new(MoveJob { offset: Point::new(5, 0) }));
        stroke.job(Box::new(MoveJob { offset: Point::new(20, 30) }));
        stroke.finish();

        assert_eq!(f.a.offset(), Point::new(20, 30));
        assert_eq!(f.b.offset(), Point::ZERO);
        assert_eq!(
            received.try_iter().collect::<Vec<_>>(),
            [StrokeEvent::HandlesRectCalculated(Rect::new(0, 0, 10, 10))]
        );
        assert_eq!(f.stack.depth(), 1);
        f.stack.undo().unwrap();
        assert_eq!(f.a.offset(), Point::ZERO);
        f.stack.redo().unwrap();
        assert_eq!(f.a.offset(), Point::new(20, 30));
    }
    #[test]
    fn cancel_restores_offsets() {
        let f = fixture();
        f.a.set_offset(Point::new(3, 4));
        let strategy = f.strategy(
            NodeSelectionRecipe::selected(f.root.clone(), vec![f.a.clone(), f.b.clone()]),
            EventSink::disconnected(),
        );
        let stroke = InlineStroke::start(strategy);
        stroke.job(Box::new(MoveJob { offset: Point::new(50, 50) }));
        assert_eq!(f.a.offset(), Point::new(53, 54));
        stroke.cancel();
        assert_eq!(f.a.offset(), Point::new(3, 4));
        assert_eq!(f.b.offset(), Point::ZERO);
        assert_eq!(f.stack.depth(), 0);
    }
    #[test]
    fn updates_are_throttled() {
        let f = fixture();
        let strategy = Arc::new(
            MoveStrategy::new(
                NodeSelectionRecipe::selected(f.root.clone(), vec![f.a.clone()]),
                f.stack.clone(),
                f.recorder.handle(),
                EventSink::disconnected(),
            )
            .with_update_interval(Duration::from_secs(3600)),
        );
        let stroke = InlineStroke::start(strategy);
        stroke.job(Box::new(MoveJob { offset: Point::new(1, 0) }));
        assert_eq!(f.a.offset(), Point::new(1, 0));
        let refreshed = f.recorder.refresh_count();
        stroke.job(Box::new(MoveJob { offset: Point::new(2, 0) }));
        stroke.job(Box::new(MoveJob { offset: Point::new(3, 0) }));
        // Postponed until the interval passes.
        assert_eq!(f.a.offset(), Point::new(1, 0));
        assert_eq!(f.recorder.refresh_count(), refreshed);
        stroke.finish();
        assert_eq!(f.a.offset(), Point::new(3, 0));
    }
    #[test]
    fn locked_and_nested_nodes_are_filtered() {
        let f = fixture();
        let group = Node::new_group("group");
        f.root.add_child(group.clone());
        let c = layer(&group, "c", Rect::new(0, 0, 1, 1));
        f.b.set_flags(NodeFlags::LOCKED, true);
        let recipe = NodeSelectionRecipe::selected(
            f.root.clone(),
            vec![c.clone(), f.b.clone(), group.clone(), f.a.clone()],
        );
        let nodes = recipe.select_nodes().unwrap();
        assert_eq!(node_ids(&nodes), [f.a.id(), group.id()]);
    }
    #[test]
    fn pick_finds_topmost_painted_layer() {
        let f = fixture();
        let top = layer(&f.root, "top", Rect::new(5, 5, 10, 10));
        let (events, received) = EventSink::channel();
        let strategy = f.strategy(NodeSelectionRecipe::pick(f.root.clone(), Point::new(6, 6)), events);
        let stroke = InlineStroke::start(strategy);
        stroke.job(Box::new(MoveJob { offset: Point::new(1, 1) }));
        stroke.finish();
        assert_eq!(top.offset(), Point::new(1, 1));
        assert_eq!(f.a.offset(), Point::ZERO);
        let received: Vec<_> = received.try_iter().collect();
        assert_eq!(received[0], StrokeEvent::LayersPicked(vec![top.id()]));
    }
    #[test]
    fn empty_pick_reports_started_empty() {
        let f = fixture();
        let (events, received) = EventSink::channel();
        let strategy = f.strategy(NodeSelectionRecipe::pick(f.root.clone(), Point::new(500, 500)), events);
        let stroke = InlineStroke::start(strategy);
        stroke.job(Box::new(MoveJob { offset: Point::new(1, 1) }));
        stroke.finish();
        assert!(received.try_iter().any(|event| event == StrokeEvent::StartedEmpty));
        assert_eq!(f.stack.depth(), 0);
    }
    #[test]
    fn lod_clone_moves_preview_plane() {
        let f = fixture();
        let strategy = f.strategy(
            NodeSelectionRecipe::selected(f.root.clone(), vec![f.a.clone()]),
            EventSink::disconnected(),
        );
        let clone = strategy.create_lod_clone(1).unwrap();
        f.a.sync_lod_plane(1);
        let preview = InlineStroke::start_at(clone, 1);
        let job = MoveJob { offset: Point::new(20, 10) };
        preview.job(job.create_lod_clone(1).unwrap());
        preview.finish();
        assert_eq!(f.a.offset_at(1), Point::new(10, 5));
        assert_eq!(f.a.offset(), Point::ZERO);
        assert_eq!(f.stack.depth(), 0);

        let full = InlineStroke::start(strategy);
        full.job(Box::new(job));
        full.finish();
        assert_eq!(f.a.offset(), Point::new(20, 10));
        assert_eq!(f.stack.depth(), 1);
    }
    #[test]
    fn lod_clone_refused_for_unsupported_nodes() {
        let f = fixture();
        f.b.set_flags(NodeFlags::SUPPORTS_LOD_MOVES, false);
        let strategy = f.strategy(
            NodeSelectionRecipe::selected(f.root.clone(), vec![f.b.clone()]),
            EventSink::disconnected(),
        );
        assert!(strategy.create_lod_clone(1).is_none());
        assert!(strategy.updates_enabled());
    }
}
