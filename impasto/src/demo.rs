//! Scripted editing session exercising every kind of stroke.

use std::sync::Arc;

use anyhow::{ensure, Context};
use impasto_core::{
    config::CodecKind,
    image::Image,
    node::Node,
    strategies::{DabJob, FilterJob, InvertFilter, MoveJob, NodeSelectionRecipe, PickLayerJob},
    strokes::{EventSink, StrokeEvent, StrokeJobData, StrokeStrategy},
    Point, Rect,
};

use crate::config::Settings;

const PAPER: [u8; 4] = [0xF0, 0xEA, 0xD6, 0xFF];
const INK: [u8; 4] = [0x20, 0x30, 0x80, 0xFF];

/// What the session did, for the final log line.
#[derive(Debug, Default)]
pub struct Summary {
    pub strokes: usize,
    pub history_depth: usize,
    pub swapped_out: usize,
    pub saved_bytes: usize,
}

struct Session {
    image: Arc<Image>,
    strokes: usize,
}
impl Session {
    /// Start a stroke, feed it `jobs`, and end or cancel it.
    fn stroke(
        &mut self,
        strategy: Arc<dyn StrokeStrategy>,
        jobs: Vec<Box<dyn StrokeJobData>>,
        cancel: bool,
    ) -> anyhow::Result<()> {
        let name = strategy.name().to_owned();
        let scheduler = self.image.scheduler();
        let id = scheduler.start_stroke(strategy)?;
        for job in jobs {
            scheduler.add_job(id, job)?;
        }
        if cancel {
            scheduler.cancel_stroke(id)?;
        } else {
            scheduler.end_stroke(id)?;
        }
        self.image.wait_for_idle();
        self.strokes += 1;
        log::info!("{name} stroke {id} {}", if cancel { "cancelled" } else { "done" });
        Ok(())
    }
}

fn moves(to: Point, steps: i32) -> Vec<Box<dyn StrokeJobData>> {
    (1..=steps)
        .map(|step| {
            Box::new(MoveJob {
                offset: Point::new(to.x * step / steps, to.y * step / steps),
            }) as Box<dyn StrokeJobData>
        })
        .collect()
}
fn drain_events(receiver: &crossbeam::channel::Receiver<StrokeEvent>) {
    for event in receiver.try_iter() {
        log::info!("stroke event: {event:?}");
    }
}

pub fn run(settings: &Settings) -> anyhow::Result<Summary> {
    let image = Image::new(settings.engine.clone())?;
    let size = settings.demo.canvas_size as i32;
    let canvas = Rect::new(0, 0, size, size);

    let paper = image.create_paint_layer("paper")?;
    let ink = image.create_paint_layer("ink")?;
    paper.device().context("paper has no pixels")?.fill_rect(canvas, &PAPER)?;
    ink.device()
        .context("ink has no pixels")?
        .fill_rect(Rect::new(size / 4, size / 4, size / 8, size / 8), &INK)?;

    let mut session = Session {
        image: image.clone(),
        strokes: 0,
    };

    let freehand = image
        .freehand_strategy(ink.clone())
        .context("freehand needs a paint layer")?;
    let dabs = (0..16)
        .map(|step| {
            Box::new(DabJob {
                center: Point::new(size / 8 + step * size / 24, size / 2),
                radius: 4,
                pixel: smallvec::SmallVec::from_slice(&INK),
            }) as Box<dyn StrokeJobData>
        })
        .collect();
    session.stroke(Arc::new(freehand), dabs, false)?;

    let filter = image
        .filter_strategy(paper.clone(), Arc::new(InvertFilter))
        .context("filter needs a paint layer")?;
    let tile_size = settings.engine.tiles.tile_size;
    let rects = FilterJob::split(Rect::new(0, 0, size / 2, size / 2), tile_size)
        .into_iter()
        .map(|job| Box::new(job) as Box<dyn StrokeJobData>)
        .collect();
    session.stroke(Arc::new(filter), rects, false)?;

    let (events, received) = EventSink::channel();
    let recipe = NodeSelectionRecipe::selected(image.root().clone(), vec![ink.clone()]);
    let strategy = image.move_strategy(recipe, events);
    session.stroke(Arc::new(strategy), moves(Point::new(size / 5, size / 7), 12), false)?;
    drain_events(&received);

    let selection = image.create_selection(Rect::new(size / 2, size / 2, size / 4, size / 4))?;
    let (events, received) = EventSink::channel();
    let strategy = image
        .move_selection_strategy(paper.clone(), selection.clone(), events)
        .context("selection move needs a paint layer")?;
    session.stroke(Arc::new(strategy), moves(Point::new(-size / 8, size / 16), 6), false)?;
    drain_events(&received);
    ensure!(
        selection.offset() == Point::new(-size / 8, size / 16),
        "selection ended at {:?}",
        selection.offset()
    );

    // Picked, dragged, then abandoned.
    let ink_at = ink.offset();
    let (events, received) = EventSink::channel();
    let pick = Point::new(size / 2 + ink_at.x, size / 2 + ink_at.y);
    let recipe = NodeSelectionRecipe::pick(image.root().clone(), pick);
    let strategy = image.move_strategy(recipe, events);
    let mut jobs: Vec<Box<dyn StrokeJobData>> = vec![Box::new(PickLayerJob { point: pick })];
    jobs.extend(moves(Point::new(30, 30), 3));
    session.stroke(Arc::new(strategy), jobs, true)?;
    drain_events(&received);
    ensure!(ink.offset() == ink_at, "cancelled move left ink at {:?}", ink.offset());

    let undo = image.undo_stack();
    let depth = undo.depth();
    image.undo()?;
    image.undo()?;
    image.wait_for_idle();
    ensure!(undo.depth() == depth - 2, "undo left depth {}", undo.depth());
    image.redo()?;
    image.wait_for_idle();
    log::info!("history depth {} after undo, undo, redo", undo.depth());

    let swapped_out = image.force_swap_out()?;
    if let Some(swapper) = image.swapper() {
        log::info!("{}", swapper.describe());
    }

    let saved_bytes = save_and_reload(settings, &ink)?;
    Ok(Summary {
        strokes: session.strokes,
        history_depth: undo.depth(),
        swapped_out,
        saved_bytes,
    })
}

/// Write `layer` to the output dir, read it back, and compare.
fn save_and_reload(settings: &Settings, layer: &Node) -> anyhow::Result<usize> {
    let device = layer.device().context("layer has no pixels")?;
    let dir = settings
        .demo
        .output
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let path = dir.join(format!("{}.impt", layer.name()));

    let mut bytes = Vec::new();
    impasto_core::io::write_device(device, CodecKind::Rle, &mut bytes)?;
    std::fs::write(&path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    log::info!(
        "saved {} to {} ({})",
        layer.name(),
        path.display(),
        human_bytes::human_bytes(bytes.len() as f64)
    );

    let mut file = std::io::BufReader::new(std::fs::File::open(&path)?);
    let reloaded = impasto_core::io::read_device(&mut file, None)?;
    ensure!(
        reloaded.content_hash()? == device.content_hash()?,
        "reloaded {} differs from the original",
        layer.name()
    );
    Ok(bytes.len())
}
