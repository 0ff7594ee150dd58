//! Admission and ordering of jobs, without any threads. The scheduler's coordinator owns one
//! [`StrokeQueue`], feeds it requests and completions, and runs whatever it hands out.

use std::{collections::VecDeque, sync::Arc};

use smallvec::SmallVec;

use super::{
    job::{JobKind, JobPhase},
    CancellationToken, Exclusivity, Job, JobContext, Sequentiality, StrokeId, StrokeJobData,
    StrokeState, StrokeStrategy,
};

pub(crate) struct StrokeEntry {
    id: StrokeId,
    strategy: Arc<dyn StrokeStrategy>,
    lod: u32,
    jobs: VecDeque<Job>,
    state: StrokeState,
    /// Still accepting user jobs.
    open: bool,
    init_started: bool,
    finish_started: bool,
    /// The finish or cancel callback has returned.
    terminal_done: bool,
    in_flight: usize,
    cancellation: CancellationToken,
    /// Preview stroke at a higher LOD, fed clones of this stroke's jobs.
    preview: Option<StrokeId>,
}
impl StrokeEntry {
    pub(crate) fn new(id: StrokeId, strategy: Arc<dyn StrokeStrategy>, lod: u32) -> Self {
        let init = Job::init(strategy.init_exclusivity());
        Self {
            id,
            strategy,
            lod,
            jobs: VecDeque::from([init]),
            state: StrokeState::Queued,
            open: true,
            init_started: false,
            finish_started: false,
            terminal_done: false,
            in_flight: 0,
            cancellation: CancellationToken::default(),
            preview: None,
        }
    }
    /// Run `job` before init.
    pub(crate) fn with_prelude(mut self, job: Job) -> Self {
        self.jobs.push_front(job);
        self
    }
    pub(crate) fn with_preview(mut self, preview: StrokeId) -> Self {
        self.preview = Some(preview);
        self
    }
    fn is_complete(&self) -> bool {
        self.terminal_done && self.jobs.is_empty() && self.in_flight == 0
    }
    fn name(&self) -> &str {
        self.strategy.name()
    }
}

/// A job handed out for execution.
pub(crate) enum Dispatch {
    Stroke(StrokeDispatch),
    Update(UpdateJob),
}

pub(crate) type UpdateJob = Box<dyn FnOnce() + Send>;

pub(crate) struct StrokeDispatch {
    pub stroke: StrokeId,
    pub lod: u32,
    pub strategy: Arc<dyn StrokeStrategy>,
    pub cancellation: CancellationToken,
    pub job: Job,
}
impl StrokeDispatch {
    /// Execute on the calling thread. Panics are caught and reported as failures.
    pub(crate) fn run(self) -> Completion {
        let Self {
            stroke,
            lod,
            strategy,
            cancellation,
            job,
        } = self;
        let ctx = JobContext::new(stroke, lod, cancellation);
        let phase = job.phase();
        let (sequentiality, exclusivity) = (job.sequentiality, job.exclusivity);
        log::trace!("{stroke} ({}): {phase} job started", strategy.name());

        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job.execute(&*strategy, &ctx)));
        let failed = match result {
            Ok(Ok(())) => false,
            Ok(Err(err)) => {
                log::error!("{stroke} ({}): {phase} job failed: {err}", strategy.name());
                true
            }
            Err(panic) => {
                let message = if let Some(message) = panic.downcast_ref::<&str>() {
                    *message
                } else if let Some(message) = panic.downcast_ref::<String>() {
                    message.as_str()
                } else {
                    "<non-string panic>"
                };
                log::error!("{stroke} ({}): {phase} job panicked: {message}", strategy.name());
                true
            }
        };
        Completion {
            stroke,
            phase,
            sequentiality,
            exclusivity,
            mutated: ctx.take_mutated(),
            failed,
        }
    }
}

/// Report of a finished stroke job.
pub(crate) struct Completion {
    pub stroke: StrokeId,
    pub phase: JobPhase,
    pub sequentiality: Sequentiality,
    pub exclusivity: Exclusivity,
    pub mutated: SmallVec<[Job; 2]>,
    pub failed: bool,
}

/// Jobs currently executing, by class. Canvas updates only count toward the total.
#[derive(Default, Debug)]
struct RunningJobs {
    total: usize,
    sequential: usize,
    uniquely_concurrent: usize,
    barrier: usize,
    exclusive: usize,
}
impl RunningJobs {
    fn admits(&self, sequentiality: Sequentiality, exclusivity: Exclusivity) -> bool {
        if self.exclusive > 0 {
            return false;
        }
        if exclusivity == Exclusivity::Exclusive {
            return self.total == 0;
        }
        match sequentiality {
            Sequentiality::Barrier => self.total == 0,
            Sequentiality::Sequential | Sequentiality::UniquelyConcurrent => {
                self.sequential + self.uniquely_concurrent + self.barrier == 0
            }
            Sequentiality::Concurrent => self.barrier == 0,
        }
    }
    fn counter(&mut self, sequentiality: Sequentiality) -> Option<&mut usize> {
        match sequentiality {
            Sequentiality::Sequential => Some(&mut self.sequential),
            Sequentiality::UniquelyConcurrent => Some(&mut self.uniquely_concurrent),
            Sequentiality::Barrier => Some(&mut self.barrier),
            Sequentiality::Concurrent => None,
        }
    }
    fn acquire(&mut self, sequentiality: Sequentiality, exclusivity: Exclusivity) {
        self.total += 1;
        if let Some(counter) = self.counter(sequentiality) {
            *counter += 1;
        }
        if exclusivity == Exclusivity::Exclusive {
            self.exclusive += 1;
        }
    }
    fn release(&mut self, sequentiality: Sequentiality, exclusivity: Exclusivity) {
        self.total = self.total.saturating_sub(1);
        if let Some(counter) = self.counter(sequentiality) {
            *counter = counter.saturating_sub(1);
        }
        if exclusivity == Exclusivity::Exclusive {
            self.exclusive = self.exclusive.saturating_sub(1);
        }
    }
}

/// Every stroke of one image, in execution order. Only the front stroke runs jobs.
#[derive(Default)]
pub(crate) struct StrokeQueue {
    strokes: VecDeque<StrokeEntry>,
    updates: VecDeque<UpdateJob>,
    running: RunningJobs,
}
impl StrokeQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }
    fn find(&mut self, id: StrokeId) -> Option<&mut StrokeEntry> {
        self.strokes.iter_mut().find(|stroke| stroke.id == id)
    }
    pub(crate) fn has_open_stroke(&self) -> bool {
        self.strokes.iter().any(|stroke| stroke.open)
    }
    pub(crate) fn open_strokes(&self) -> Vec<StrokeId> {
        self.strokes
            .iter()
            .filter(|stroke| stroke.open)
            .map(|stroke| stroke.id)
            .collect()
    }
    /// No stroke left and nothing running.
    pub(crate) fn is_idle(&self) -> bool {
        self.strokes.is_empty() && self.updates.is_empty() && self.running.total == 0
    }
    pub(crate) fn state(&self, id: StrokeId) -> StrokeState {
        self.strokes
            .iter()
            .find(|stroke| stroke.id == id)
            .map_or(StrokeState::Done, |stroke| stroke.state)
    }

    pub(crate) fn push_stroke(&mut self, stroke: StrokeEntry) {
        log::debug!("{} ({}) queued at LOD {}", stroke.id, stroke.name(), stroke.lod);
        self.strokes.push_back(stroke);
    }
    /// Returns whether the job was accepted.
    pub(crate) fn add_job(&mut self, id: StrokeId, data: Box<dyn StrokeJobData>) -> bool {
        let Some(stroke) = self.find(id) else {
            log::warn!("{id}: job {data:?} for a stroke that's gone, dropped");
            return false;
        };
        if !stroke.open {
            log::warn!("{id}: job {data:?} after the stroke was closed, dropped");
            return false;
        }
        let preview = stroke.preview;
        let preview_job = preview.and_then(|preview| {
            let level = self.find(preview)?.lod;
            data.create_lod_clone(level).map(|clone| (preview, clone))
        });
        if let Some((preview, clone)) = preview_job {
            if let Some(preview) = self.find(preview).filter(|preview| preview.open) {
                preview.jobs.push_back(Job::data(clone));
            }
        }
        if let Some(stroke) = self.find(id) {
            stroke.jobs.push_back(Job::data(data));
        }
        true
    }
    pub(crate) fn end_stroke(&mut self, id: StrokeId) -> bool {
        let Some(stroke) = self.find(id) else {
            log::warn!("{id}: end of a stroke that's gone, ignored");
            return false;
        };
        if !stroke.open {
            log::warn!("{id}: stroke ended twice, ignored");
            return false;
        }
        let preview = stroke.preview;
        Self::close(stroke);
        if let Some(preview) = preview.and_then(|preview| self.find(preview)) {
            if preview.open {
                Self::close(preview);
            }
        }
        true
    }
    fn close(stroke: &mut StrokeEntry) {
        stroke.open = false;
        stroke.state = StrokeState::Finishing;
        stroke
            .jobs
            .push_back(Job::finish(stroke.strategy.finish_exclusivity()));
        log::debug!("{} ({}) finishing", stroke.id, stroke.name());
    }
    /// Returns whether anything was cancelled.
    pub(crate) fn cancel_stroke(&mut self, id: StrokeId) -> bool {
        let Some(stroke) = self.find(id) else {
            log::debug!("{id}: cancel of a stroke that's gone, ignored");
            return false;
        };
        let preview = stroke.preview;
        let cancelled = Self::cancel(stroke);
        if let Some(preview) = preview.and_then(|preview| self.find(preview)) {
            Self::cancel(preview);
        }
        self.remove_completed();
        cancelled
    }
    fn cancel(stroke: &mut StrokeEntry) -> bool {
        if stroke.state == StrokeState::Cancelling || stroke.terminal_done {
            return false;
        }
        if stroke.finish_started {
            log::warn!("{} ({}): finish already started, can't cancel", stroke.id, stroke.name());
            return false;
        }
        stroke.cancellation.cancel();
        stroke.open = false;
        stroke.state = StrokeState::Cancelling;
        if stroke.init_started {
            stroke.jobs.retain(|job| !job.is_droppable());
            stroke
                .jobs
                .push_back(Job::cancel(stroke.strategy.cancel_exclusivity()));
            log::debug!("{} ({}) cancelling", stroke.id, stroke.name());
        } else {
            // Nothing was done, so there's nothing to revert.
            stroke.jobs.clear();
            stroke.terminal_done = true;
            log::debug!("{} ({}) cancelled before init", stroke.id, stroke.name());
        }
        true
    }
    /// Stop a stroke whose job failed, reverting through its cancel callback if anything ran.
    fn fail(stroke: &mut StrokeEntry, phase: JobPhase) {
        stroke.cancellation.cancel();
        stroke.open = false;
        stroke.jobs.clear();
        if phase == JobPhase::Cancel || !stroke.init_started {
            stroke.terminal_done = true;
            stroke.state = StrokeState::Cancelling;
            return;
        }
        stroke.terminal_done = false;
        stroke.state = StrokeState::Cancelling;
        stroke
            .jobs
            .push_back(Job::cancel(stroke.strategy.cancel_exclusivity()));
    }

    pub(crate) fn add_update(&mut self, update: UpdateJob) {
        self.updates.push_back(update);
    }

    /// Next job allowed to start right now, if any.
    pub(crate) fn next_job(&mut self) -> Option<Dispatch> {
        self.remove_completed();
        let mut updates_held = self.running.exclusive > 0;
        if let Some(stroke) = self.strokes.front_mut() {
            if stroke.state == StrokeState::Queued {
                stroke.state = StrokeState::Active;
                log::debug!("{} ({}) active", stroke.id, stroke.name());
            }
            if let Some(job) = stroke.jobs.front() {
                let (sequentiality, exclusivity) = (job.sequentiality, job.exclusivity);
                if self.running.admits(sequentiality, exclusivity) {
                    let job = stroke.jobs.pop_front()?;
                    match job.kind {
                        JobKind::Init => stroke.init_started = true,
                        JobKind::Finish => stroke.finish_started = true,
                        _ => (),
                    }
                    stroke.in_flight += 1;
                    self.running.acquire(sequentiality, exclusivity);
                    return Some(Dispatch::Stroke(StrokeDispatch {
                        stroke: stroke.id,
                        lod: stroke.lod,
                        strategy: stroke.strategy.clone(),
                        cancellation: stroke.cancellation.clone(),
                        job,
                    }));
                }
                // Let the running jobs drain instead of starving a waiting fence.
                updates_held |= exclusivity == Exclusivity::Exclusive
                    || sequentiality == Sequentiality::Barrier;
            }
        }
        if updates_held {
            return None;
        }
        let update = self.updates.pop_front()?;
        self.running.total += 1;
        Some(Dispatch::Update(update))
    }

    pub(crate) fn job_done(&mut self, completion: Completion) {
        self.running
            .release(completion.sequentiality, completion.exclusivity);
        let Some(stroke) = self.find(completion.stroke) else {
            log::error!("{}: completion for an unknown stroke", completion.stroke);
            return;
        };
        stroke.in_flight = stroke.in_flight.saturating_sub(1);
        log::trace!("{} ({}): {} job done", stroke.id, stroke.name(), completion.phase);
        if matches!(completion.phase, JobPhase::Finish | JobPhase::Cancel) {
            stroke.terminal_done = true;
        }
        if completion.failed {
            Self::fail(stroke, completion.phase);
        } else {
            let cancelling =
                stroke.state == StrokeState::Cancelling && completion.phase != JobPhase::Cancel;
            for job in completion.mutated.into_iter().rev() {
                if cancelling && job.is_droppable() {
                    continue;
                }
                stroke.jobs.push_front(job);
            }
        }
        self.remove_completed();
    }
    pub(crate) fn update_done(&mut self) {
        self.running.total = self.running.total.saturating_sub(1);
    }

    fn remove_completed(&mut self) {
        self.strokes.retain(|stroke| {
            if stroke.is_complete() {
                log::debug!("{} ({}) done", stroke.id, stroke.name());
                false
            } else {
                true
            }
        });
    }
}
