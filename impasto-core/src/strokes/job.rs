use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::{strategy::StrokeError, StrokeId, StrokeStrategy};
use crate::lod::LodTransform;

/// How a job may overlap other jobs of its stroke.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum Sequentiality {
    /// Runs in queue order, never alongside sequential, uniquely concurrent or barrier jobs.
    Sequential,
    /// Runs alongside anything but a barrier.
    Concurrent,
    /// Waits for every running job to complete, and nothing starts until it completes.
    Barrier,
    /// Concurrent, but never alongside another uniquely concurrent or sequential job.
    UniquelyConcurrent,
}

/// How a job may overlap jobs of other strokes and canvas updates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum Exclusivity {
    Normal,
    /// Runs alone on the whole image.
    Exclusive,
}

/// Payload of one user job, interpreted by the stroke's strategy.
pub trait StrokeJobData: Any + Send + std::fmt::Debug {
    fn sequentiality(&self) -> Sequentiality {
        Sequentiality::Sequential
    }
    fn exclusivity(&self) -> Exclusivity {
        Exclusivity::Normal
    }
    /// The same job, expressed for a preview stroke at LOD `level`. `None` skips the job in the
    /// preview.
    fn create_lod_clone(&self, level: u32) -> Option<Box<dyn StrokeJobData>> {
        let _ = level;
        None
    }
    fn as_any(&self) -> &dyn Any;
}
impl dyn StrokeJobData {
    #[must_use]
    pub fn downcast_ref<T: StrokeJobData>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
    #[must_use]
    pub fn is<T: StrokeJobData>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

pub(crate) type RunnableFn = Box<dyn FnOnce(&JobContext) -> Result<(), StrokeError> + Send>;

pub(crate) enum JobKind {
    Init,
    Data(Box<dyn StrokeJobData>),
    Runnable(RunnableFn),
    Finish,
    Cancel,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub(crate) enum JobPhase {
    Init,
    Data,
    Finish,
    Cancel,
}

/// One queued unit of work of a stroke.
pub struct Job {
    pub(crate) sequentiality: Sequentiality,
    pub(crate) exclusivity: Exclusivity,
    pub(crate) kind: JobKind,
}
impl Job {
    // Lifecycle jobs always fence off the rest of their stroke.
    pub(crate) fn init(exclusivity: Exclusivity) -> Self {
        Self {
            sequentiality: Sequentiality::Barrier,
            exclusivity,
            kind: JobKind::Init,
        }
    }
    pub(crate) fn finish(exclusivity: Exclusivity) -> Self {
        Self {
            sequentiality: Sequentiality::Barrier,
            exclusivity,
            kind: JobKind::Finish,
        }
    }
    pub(crate) fn cancel(exclusivity: Exclusivity) -> Self {
        Self {
            sequentiality: Sequentiality::Barrier,
            exclusivity,
            kind: JobKind::Cancel,
        }
    }
    #[must_use]
    pub fn data(data: Box<dyn StrokeJobData>) -> Self {
        Self {
            sequentiality: data.sequentiality(),
            exclusivity: data.exclusivity(),
            kind: JobKind::Data(data),
        }
    }
    #[must_use]
    pub fn runnable(
        sequentiality: Sequentiality,
        exclusivity: Exclusivity,
        job: impl FnOnce(&JobContext) -> Result<(), StrokeError> + Send + 'static,
    ) -> Self {
        Self {
            sequentiality,
            exclusivity,
            kind: JobKind::Runnable(Box::new(job)),
        }
    }
    #[must_use]
    pub fn sequentiality(&self) -> Sequentiality {
        self.sequentiality
    }
    #[must_use]
    pub fn exclusivity(&self) -> Exclusivity {
        self.exclusivity
    }
    pub(crate) fn phase(&self) -> JobPhase {
        match self.kind {
            JobKind::Init => JobPhase::Init,
            JobKind::Data(_) | JobKind::Runnable(_) => JobPhase::Data,
            JobKind::Finish => JobPhase::Finish,
            JobKind::Cancel => JobPhase::Cancel,
        }
    }
    /// Whether cancelling the stroke may drop this job unexecuted.
    pub(crate) fn is_droppable(&self) -> bool {
        match self.kind {
            JobKind::Data(_) | JobKind::Runnable(_) => matches!(
                self.sequentiality,
                Sequentiality::Concurrent | Sequentiality::UniquelyConcurrent
            ),
            JobKind::Finish => true,
            JobKind::Init | JobKind::Cancel => false,
        }
    }
    pub(crate) fn execute(self, strategy: &dyn StrokeStrategy, ctx: &JobContext) -> Result<(), StrokeError> {
        match self.kind {
            JobKind::Init => strategy.init(ctx),
            JobKind::Data(data) => strategy.do_job(ctx, data),
            JobKind::Runnable(job) => job(ctx),
            JobKind::Finish => strategy.finish(ctx),
            JobKind::Cancel => strategy.cancel(ctx),
        }
    }
}
impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Job");
        debug
            .field("sequentiality", &self.sequentiality)
            .field("exclusivity", &self.exclusivity)
            .field("phase", &self.phase());
        if let JobKind::Data(data) = &self.kind {
            debug.field("data", data);
        }
        debug.finish()
    }
}

/// Cooperative cancellation flag shared by every job of a stroke.
/// Long running jobs should poll it and return early once set.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);
impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handed to every job while it runs.
pub struct JobContext {
    stroke: StrokeId,
    lod: u32,
    cancellation: CancellationToken,
    mutated: Mutex<SmallVec<[Job; 2]>>,
}
impl JobContext {
    pub(crate) fn new(stroke: StrokeId, lod: u32, cancellation: CancellationToken) -> Self {
        Self {
            stroke,
            lod,
            cancellation,
            mutated: Mutex::new(SmallVec::new()),
        }
    }
    #[must_use]
    pub fn stroke(&self) -> StrokeId {
        self.stroke
    }
    /// Level of detail this stroke runs at, zero being full resolution.
    #[must_use]
    pub fn lod(&self) -> u32 {
        self.lod
    }
    #[must_use]
    pub fn lod_transform(&self) -> LodTransform {
        LodTransform::new(self.lod)
    }
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
    /// Queue `data` on this stroke, ahead of every job still waiting. Jobs added by one job keep
    /// the order they were added in.
    pub fn add_mutated_job(&self, data: Box<dyn StrokeJobData>) {
        self.mutated.lock().push(Job::data(data));
    }
    pub fn add_runnable_job(
        &self,
        sequentiality: Sequentiality,
        exclusivity: Exclusivity,
        job: impl FnOnce(&JobContext) -> Result<(), StrokeError> + Send + 'static,
    ) {
        self.mutated
            .lock()
            .push(Job::runnable(sequentiality, exclusivity, job));
    }
    pub(crate) fn take_mutated(&self) -> SmallVec<[Job; 2]> {
        std::mem::take(&mut *self.mutated.lock())
    }
}
