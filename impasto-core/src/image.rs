//! # Image
//! The [`Image`] ties the engine together: a node tree, a projection the visible layers are
//! composited into, the undo history, and the scheduler running strokes over it all.
//!
//! Canvas refreshes requested by strokes and commands run as update jobs on the scheduler's pool,
//! so they interleave with stroke jobs under the scheduler's exclusivity rules.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;

use crate::{
    config::{ConfigError, EngineConfig},
    device::{DeviceError, PaintDevice},
    node::Node,
    selection::Selection,
    strategies::{
        FilterStrategy, FreehandStrategy, MoveSelectionStrategy, MoveStrategy, NodeSelectionRecipe, PixelFilter,
        UndoCommandStrategy,
    },
    strokes::{EventSink, SchedulerError, SchedulerOptions, StrokeId, StrokeScheduler, StrokeStrategy},
    swap::{SwapError, Swapper},
    undo::UndoStack,
    updates::{UpdatesFacade, UpdatesHandle},
    util::Rect,
};

/// Projection pixels are straight-alpha RGBA8.
const PROJECTION_PIXEL: [u8; 4] = [0; 4];

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("failed to set up swap: {0}")]
    Swap(#[from] SwapError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Default)]
struct Blocked {
    depth: usize,
    postponed: Rect,
}

pub struct Image {
    config: EngineConfig,
    root: Arc<Node>,
    projection: Arc<PaintDevice>,
    undo: Arc<UndoStack>,
    swapper: Option<Arc<Swapper>>,
    scheduler: StrokeScheduler,
    blocked: Mutex<Blocked>,
    pending_updates: Arc<AtomicUsize>,
    this: Weak<Image>,
}
impl Image {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, ImageError> {
        config.validate()?;
        let swapper = Swapper::from_config(&config.swap)?;
        let scheduler = StrokeScheduler::new(SchedulerOptions::from_config(&config))?;
        let projection = Arc::new(PaintDevice::new(config.tiles.tile_size, &PROJECTION_PIXEL, None)?);
        let image = Arc::new_cyclic(|this| Self {
            root: Node::new_group("root"),
            projection,
            undo: Arc::new(UndoStack::new()),
            swapper,
            scheduler,
            blocked: Mutex::new(Blocked::default()),
            pending_updates: Arc::new(AtomicUsize::new(0)),
            this: this.clone(),
            config,
        });

        let weak = image.this.clone();
        image.scheduler.set_lod_sync_hook(move |level| {
            if let Some(image) = weak.upgrade() {
                image.sync_lod_planes(level);
            }
        });
        if image.swapper.is_some() {
            let weak = image.this.clone();
            image.scheduler.set_idle_hook(move || {
                let Some(image) = weak.upgrade() else {
                    return;
                };
                match image.swap_out_cold() {
                    Ok(0) => (),
                    Ok(count) => log::debug!("idle, swapped out {count} cold tiles"),
                    Err(err) => log::error!("swapping out cold tiles failed: {err}"),
                }
            });
        }
        log::info!(
            "image created, {}px tiles, swap {}",
            image.config.tiles.tile_size,
            if image.swapper.is_some() { "on" } else { "off" }
        );
        Ok(image)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
    #[must_use]
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }
    /// Composite of every visible layer, refreshed by update jobs.
    #[must_use]
    pub fn projection(&self) -> &Arc<PaintDevice> {
        &self.projection
    }
    #[must_use]
    pub fn undo_stack(&self) -> &Arc<UndoStack> {
        &self.undo
    }
    #[must_use]
    pub fn scheduler(&self) -> &StrokeScheduler {
        &self.scheduler
    }
    #[must_use]
    pub fn swapper(&self) -> Option<&Arc<Swapper>> {
        self.swapper.as_ref()
    }
    /// Handle strokes and commands use to request refreshes of this image.
    #[must_use]
    pub fn updates_handle(&self) -> UpdatesHandle {
        let weak: Weak<dyn UpdatesFacade> = self.this.clone();
        UpdatesHandle::from_weak(weak)
    }

    /// New RGBA8 paint layer on top of the root.
    pub fn create_paint_layer(&self, name: &str) -> Result<Arc<Node>, ImageError> {
        let device = PaintDevice::new(self.config.tiles.tile_size, &PROJECTION_PIXEL, self.swapper.clone())?;
        let node = Node::new_paint_layer(name, Arc::new(device));
        self.root.add_child(node.clone());
        log::debug!("created layer {} ({name})", node.id());
        Ok(node)
    }
    /// Selection of `rect`, with this image's tile size.
    pub fn create_selection(&self, rect: Rect) -> Result<Arc<Selection>, ImageError> {
        Ok(Arc::new(Selection::from_rect(self.config.tiles.tile_size, rect)?))
    }
    /// Devices of every paint layer.
    #[must_use]
    pub fn devices(&self) -> Vec<Arc<PaintDevice>> {
        self.root
            .subtree()
            .iter()
            .filter_map(|node| node.device().cloned())
            .collect()
    }

    #[must_use]
    pub fn move_strategy(&self, recipe: NodeSelectionRecipe, events: EventSink) -> MoveStrategy {
        MoveStrategy::new(recipe, self.undo.clone(), self.updates_handle(), events)
            .with_update_interval(self.config.strokes.update_interval())
    }
    #[must_use]
    pub fn move_selection_strategy(
        &self,
        node: Arc<Node>,
        selection: Arc<Selection>,
        events: EventSink,
    ) -> Option<MoveSelectionStrategy> {
        MoveSelectionStrategy::new(node, selection, self.undo.clone(), self.updates_handle(), events)
    }
    #[must_use]
    pub fn filter_strategy(&self, node: Arc<Node>, filter: Arc<dyn PixelFilter>) -> Option<FilterStrategy> {
        FilterStrategy::new(node, filter, self.undo.clone(), self.updates_handle())
    }
    #[must_use]
    pub fn freehand_strategy(&self, node: Arc<Node>) -> Option<FreehandStrategy> {
        FreehandStrategy::new(node, self.undo.clone(), self.updates_handle())
    }

    /// Undo the last history entry, as a stroke ordered after every earlier one.
    pub fn undo(&self) -> Result<StrokeId, ImageError> {
        self.run_closed(Arc::new(UndoCommandStrategy::undo(self.undo.clone())))
    }
    pub fn redo(&self) -> Result<StrokeId, ImageError> {
        self.run_closed(Arc::new(UndoCommandStrategy::redo(self.undo.clone())))
    }
    fn run_closed(&self, strategy: Arc<dyn StrokeStrategy>) -> Result<StrokeId, ImageError> {
        let id = self.scheduler.start_stroke(strategy)?;
        self.scheduler.end_stroke(id)?;
        Ok(id)
    }
    pub fn wait_for_idle(&self) {
        self.scheduler.wait_for_idle();
    }

    /// Reset every LOD `level` plane from the image positions.
    pub fn sync_lod_planes(&self, level: u32) {
        for node in self.root.subtree() {
            node.sync_lod_plane(level);
        }
        log::trace!("synced LOD {level} planes");
    }
    /// Swap out tiles colder than the configured window, on every layer.
    ///
    /// A layer failing to swap doesn't stop the others. Returns how many tiles went out, or the
    /// first error.
    pub fn swap_out_cold(&self) -> Result<usize, DeviceError> {
        let window = self.config.swap.cold_window;
        self.swap_out_each(|device| device.swap_out_cold(window))
    }
    pub fn force_swap_out(&self) -> Result<usize, DeviceError> {
        self.swap_out_each(PaintDevice::force_swap_out)
    }
    fn swap_out_each(&self, swap_out: impl Fn(&PaintDevice) -> Result<usize, DeviceError>) -> Result<usize, DeviceError> {
        let mut count = 0;
        let mut first_err = None;
        for device in self.devices() {
            match swap_out(&device) {
                Ok(swapped) => count += swapped,
                Err(err) => {
                    log::warn!("swap-out of {:?} failed: {err}", device.id());
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(count), Err)
    }

    /// Projection pixels of `rect`, row-major.
    pub fn read_projection(&self, rect: Rect) -> Result<Vec<[u8; 4]>, DeviceError> {
        let bytes = self.projection.read_rect(rect)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    fn schedule_refresh(&self, rect: Rect) {
        let weak = self.this.clone();
        let pending = self.pending_updates.clone();
        pending.fetch_add(1, Ordering::AcqRel);
        let posted = self.scheduler.add_update_job(move || {
            if let Some(image) = weak.upgrade() {
                if let Err(err) = image.recomposite(rect) {
                    log::error!("refreshing {rect:?} failed: {err}");
                }
            }
            pending.fetch_sub(1, Ordering::AcqRel);
        });
        if let Err(err) = posted {
            self.pending_updates.fetch_sub(1, Ordering::AcqRel);
            log::warn!("refresh of {rect:?} dropped: {err}");
        }
    }
    /// Rebuild the projection under `rect` from the visible layers, bottom to top.
    fn recomposite(&self, rect: Rect) -> Result<(), DeviceError> {
        let mut composite = PROJECTION_PIXEL.repeat(rect.area());
        for node in self.root.subtree() {
            if !shown(&node) {
                continue;
            }
            if let Some(device) = node.device() {
                blend(&mut composite, device, rect, u8::MAX)?;
            }
            if let Some(target) = node.temporary_target() {
                blend(&mut composite, &target.device, rect, target.opacity)?;
            }
        }
        self.projection.write_rect(rect, &composite)?;
        log::trace!("recomposited {rect:?}");
        Ok(())
    }
}
impl UpdatesFacade for Image {
    fn refresh_graph_async(&self, node: &Arc<Node>, rect: Rect) {
        {
            let mut blocked = self.blocked.lock();
            if blocked.depth > 0 {
                blocked.postponed |= rect;
                return;
            }
        }
        log::trace!("refresh of {rect:?} after {} changed", node.id());
        self.schedule_refresh(rect);
    }
    fn has_updates_running(&self) -> bool {
        self.pending_updates.load(Ordering::Acquire) > 0
    }
    fn block_updates(&self) {
        self.blocked.lock().depth += 1;
    }
    fn unblock_updates(&self) {
        let postponed = {
            let mut blocked = self.blocked.lock();
            if blocked.depth == 0 {
                log::warn!("unbalanced unblock of image updates");
                return;
            }
            blocked.depth -= 1;
            if blocked.depth > 0 {
                return;
            }
            std::mem::take(&mut blocked.postponed)
        };
        if !postponed.is_empty() {
            self.schedule_refresh(postponed);
        }
    }
}
impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("root", &self.root)
            .field("undo", &self.undo)
            .field("swapper", &self.swapper)
            .finish_non_exhaustive()
    }
}

/// Whether `node` and all its ancestors are visible.
fn shown(node: &Node) -> bool {
    node.is_visible() && node.parent().map_or(true, |parent| shown(&parent))
}
fn blend(composite: &mut [u8], device: &PaintDevice, rect: Rect, opacity: u8) -> Result<(), DeviceError> {
    if device.pixel_size() != PROJECTION_PIXEL.len() {
        log::trace!("{:?} has no RGBA pixels, not composited", device.id());
        return Ok(());
    }
    let source = device.read_rect(rect)?;
    for (dst, src) in composite.chunks_exact_mut(4).zip(source.chunks_exact(4)) {
        crate::compose::over(dst, src, opacity);
    }
    Ok(())
}
