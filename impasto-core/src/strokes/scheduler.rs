use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{JoinHandle, ThreadId},
};

use crossbeam::channel::{Receiver, Sender};
use parking_lot::RwLock;

use super::{
    queue::{Completion, Dispatch, StrokeEntry, StrokeQueue, UpdateJob},
    Exclusivity, Job, Sequentiality, StrokeId, StrokeJobData, StrokeState, StrokeStrategy,
};
use crate::config::EngineConfig;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("strokes can't be started: {0}")]
    NotMutable(&'static str),
    #[error("scheduler has shut down")]
    ShutDown,
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to spawn coordinator: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub worker_threads: usize,
    /// Level of detail of preview strokes. Zero disables previews.
    pub lod_level: u32,
}
impl SchedulerOptions {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            worker_threads: config.scheduler.resolve_threads(),
            lod_level: config.strokes.lod_level,
        }
    }
}
impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

type IdleHook = Arc<dyn Fn() + Send + Sync>;
type LodSyncHook = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    idle: Option<IdleHook>,
    lod_sync: Option<LodSyncHook>,
}

enum Message {
    Start {
        strokes: Vec<StrokeEntry>,
        reply: Sender<Result<(), SchedulerError>>,
    },
    AddJob(StrokeId, Box<dyn StrokeJobData>),
    End(StrokeId),
    Cancel(StrokeId),
    Update(UpdateJob),
    Completed(Completion),
    UpdateDone,
    State(StrokeId, Sender<StrokeState>),
    WaitIdle(Sender<()>),
    Shutdown,
}

/// Runs the strokes of one image.
///
/// Queue state lives on a coordinator thread, which hands admissible jobs to a worker pool.
/// Every method only posts a message to it, so they may be called from any thread, jobs included.
/// The exceptions are [`StrokeScheduler::start_stroke`], [`StrokeScheduler::stroke_state`] and
/// [`StrokeScheduler::wait_for_idle`], which wait for an answer. Waiting for idle from inside a
/// job never returns.
pub struct StrokeScheduler {
    mailbox: Sender<Message>,
    coordinator: Option<JoinHandle<()>>,
    coordinator_thread: ThreadId,
    hooks: Arc<RwLock<Hooks>>,
    lod_level: u32,
}
impl StrokeScheduler {
    pub fn new(options: SchedulerOptions) -> Result<Self, SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.worker_threads)
            .thread_name(|idx| format!("stroke worker {idx}"))
            .build()?;
        let (mailbox, inbox) = crossbeam::channel::unbounded();
        let hooks = Arc::new(RwLock::new(Hooks::default()));
        let coordinator = Coordinator {
            queue: StrokeQueue::new(),
            pool,
            inbox,
            outbox: mailbox.clone(),
            hooks: hooks.clone(),
            idle_waiters: Vec::new(),
            idle_running: Arc::new(AtomicBool::new(false)),
            busy: false,
            shutting_down: false,
        };
        let handle = std::thread::Builder::new()
            .name("stroke coordinator".to_owned())
            .spawn(move || coordinator.run())?;
        log::debug!(
            "stroke scheduler started, {} workers, LOD {}",
            options.worker_threads,
            options.lod_level
        );
        Ok(Self {
            mailbox,
            coordinator_thread: handle.thread().id(),
            coordinator: Some(handle),
            hooks,
            lod_level: options.lod_level,
        })
    }
    #[must_use]
    pub fn lod_level(&self) -> u32 {
        self.lod_level
    }
    /// Run `hook` on the worker pool every time all work has drained. A run still in progress
    /// when work drains again is not overlapped by another.
    pub fn set_idle_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.write().idle = Some(Arc::new(hook));
    }
    /// Run `hook` with the preview level, as an exclusive job, before every preview stroke.
    pub fn set_lod_sync_hook(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        self.hooks.write().lod_sync = Some(Arc::new(hook));
    }
    fn send(&self, message: Message) -> Result<(), SchedulerError> {
        self.mailbox
            .send(message)
            .map_err(|_| SchedulerError::ShutDown)
    }

    /// Open a new stroke. Fails while another stroke is still open, or once shutdown began.
    ///
    /// If previews are enabled and the strategy offers a LOD clone, the clone runs as a preview
    /// stroke ahead of this one and receives clones of every job added to it.
    pub fn start_stroke(&self, strategy: Arc<dyn StrokeStrategy>) -> Result<StrokeId, SchedulerError> {
        let id = StrokeId::new();
        let mut strokes = Vec::with_capacity(2);
        let mut entry = StrokeEntry::new(id, strategy.clone(), 0);
        if self.lod_level > 0 {
            match strategy.create_lod_clone(self.lod_level) {
                Some(clone) => {
                    let preview = StrokeId::new();
                    let mut preview_entry = StrokeEntry::new(preview, clone, self.lod_level);
                    let sync = self.hooks.read().lod_sync.clone();
                    if let Some(sync) = sync {
                        let level = self.lod_level;
                        preview_entry = preview_entry.with_prelude(Job::runnable(
                            Sequentiality::Barrier,
                            Exclusivity::Exclusive,
                            move |_| {
                                sync(level);
                                Ok(())
                            },
                        ));
                    }
                    log::debug!("{id} ({}) previewed by {preview}", strategy.name());
                    strokes.push(preview_entry);
                    entry = entry.with_preview(preview);
                }
                None => log::debug!("{id} ({}) refused a LOD clone", strategy.name()),
            }
        }
        strokes.push(entry);
        let (reply, response) = crossbeam::channel::bounded(1);
        self.send(Message::Start { strokes, reply })?;
        response.recv().map_err(|_| SchedulerError::ShutDown)??;
        Ok(id)
    }
    /// Queue a job on an open stroke. Jobs for strokes that aren't open are dropped.
    pub fn add_job(&self, id: StrokeId, data: Box<dyn StrokeJobData>) -> Result<(), SchedulerError> {
        self.send(Message::AddJob(id, data))
    }
    /// Close the stroke. Its remaining jobs run, then its finish callback.
    pub fn end_stroke(&self, id: StrokeId) -> Result<(), SchedulerError> {
        self.send(Message::End(id))
    }
    /// Close and revert the stroke, along with its preview.
    pub fn cancel_stroke(&self, id: StrokeId) -> Result<(), SchedulerError> {
        self.send(Message::Cancel(id))
    }
    /// Run `update` on the worker pool, alongside stroke jobs that aren't fences.
    pub fn add_update_job(&self, update: impl FnOnce() + Send + 'static) -> Result<(), SchedulerError> {
        self.send(Message::Update(Box::new(update)))
    }
    /// Strokes the scheduler no longer knows of are [`StrokeState::Done`].
    #[must_use]
    pub fn stroke_state(&self, id: StrokeId) -> StrokeState {
        let (reply, response) = crossbeam::channel::bounded(1);
        if self.send(Message::State(id, reply)).is_err() {
            return StrokeState::Done;
        }
        response.recv().unwrap_or(StrokeState::Done)
    }
    /// Block until every stroke is done and no updates remain. An open stroke keeps the
    /// scheduler busy until it's ended or cancelled.
    pub fn wait_for_idle(&self) {
        let (reply, response) = crossbeam::channel::bounded(1);
        if self.send(Message::WaitIdle(reply)).is_ok() {
            let _ = response.recv();
        }
    }
}
impl Drop for StrokeScheduler {
    fn drop(&mut self) {
        let _ = self.mailbox.send(Message::Shutdown);
        let Some(coordinator) = self.coordinator.take() else {
            return;
        };
        // Joining from one of our own threads would wait on ourselves.
        let own_thread = std::thread::current().id() == self.coordinator_thread
            || rayon::current_thread_index().is_some();
        if own_thread {
            log::debug!("stroke scheduler dropped from a worker, coordinator left detached");
            return;
        }
        if coordinator.join().is_err() {
            log::error!("stroke coordinator panicked");
        }
    }
}

struct Coordinator {
    queue: StrokeQueue,
    pool: rayon::ThreadPool,
    inbox: Receiver<Message>,
    outbox: Sender<Message>,
    hooks: Arc<RwLock<Hooks>>,
    idle_waiters: Vec<Sender<()>>,
    idle_running: Arc<AtomicBool>,
    /// Anything dispatched since the queue last drained.
    busy: bool,
    shutting_down: bool,
}
impl Coordinator {
    fn run(mut self) {
        while let Ok(message) = self.inbox.recv() {
            self.handle(message);
            while let Ok(message) = self.inbox.try_recv() {
                self.handle(message);
            }
            self.dispatch();
            self.settle();
            if self.shutting_down && self.queue.is_idle() {
                break;
            }
        }
        log::debug!("stroke coordinator exiting");
    }
    fn handle(&mut self, message: Message) {
        match message {
            Message::Start { strokes, reply } => {
                let result = if self.shutting_down {
                    Err(SchedulerError::NotMutable("shutting down"))
                } else if self.queue.has_open_stroke() {
                    Err(SchedulerError::NotMutable("another stroke is still open"))
                } else {
                    strokes
                        .into_iter()
                        .for_each(|stroke| self.queue.push_stroke(stroke));
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Message::AddJob(id, data) => {
                self.queue.add_job(id, data);
            }
            Message::End(id) => {
                self.queue.end_stroke(id);
            }
            Message::Cancel(id) => {
                self.queue.cancel_stroke(id);
            }
            Message::Update(update) => self.queue.add_update(update),
            Message::Completed(completion) => self.queue.job_done(completion),
            Message::UpdateDone => self.queue.update_done(),
            Message::State(id, reply) => {
                let _ = reply.send(self.queue.state(id));
            }
            Message::WaitIdle(reply) => self.idle_waiters.push(reply),
            Message::Shutdown => {
                log::debug!("stroke scheduler shutting down");
                self.shutting_down = true;
                for id in self.queue.open_strokes() {
                    log::warn!("{id} still open at shutdown, cancelling");
                    self.queue.cancel_stroke(id);
                }
            }
        }
    }
    fn dispatch(&mut self) {
        while let Some(dispatch) = self.queue.next_job() {
            self.busy = true;
            let outbox = self.outbox.clone();
            match dispatch {
                Dispatch::Stroke(job) => self.pool.spawn(move || {
                    let completion = job.run();
                    let _ = outbox.send(Message::Completed(completion));
                }),
                Dispatch::Update(update) => self.pool.spawn(move || {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(update)).is_err() {
                        log::error!("canvas update panicked");
                    }
                    let _ = outbox.send(Message::UpdateDone);
                }),
            }
        }
    }
    fn settle(&mut self) {
        if !self.queue.is_idle() {
            return;
        }
        if std::mem::take(&mut self.busy) {
            let hook = self.hooks.read().idle.clone();
            if let Some(hook) = hook {
                self.spawn_idle(hook);
            }
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
    fn spawn_idle(&self, hook: IdleHook) {
        if self.idle_running.swap(true, Ordering::AcqRel) {
            log::trace!("idle hook still running, skipped");
            return;
        }
        let running = self.idle_running.clone();
        self.pool.spawn(move || {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook())).is_err() {
                log::error!("idle hook panicked");
            }
            running.store(false, Ordering::Release);
        });
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::strokes::{JobContext, StrokeError};

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Debug)]
    struct Step {
        tag: &'static str,
        sequentiality: Sequentiality,
        delay_ms: u64,
        panics: bool,
    }
    impl Step {
        fn new(tag: &'static str, sequentiality: Sequentiality, delay_ms: u64) -> Box<Self> {
            Box::new(Self {
                tag,
                sequentiality,
                delay_ms,
                panics: false,
            })
        }
    }
    impl StrokeJobData for Step {
        fn sequentiality(&self) -> Sequentiality {
            self.sequentiality
        }
        fn create_lod_clone(&self, _level: u32) -> Option<Box<dyn StrokeJobData>> {
            Some(Box::new(self.clone()))
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct Recorder {
        log: Log,
        previews: bool,
    }
    impl Recorder {
        fn new(log: &Log) -> Arc<Self> {
            Arc::new(Self {
                log: log.clone(),
                previews: false,
            })
        }
        fn push(&self, entry: String) {
            self.log.lock().push(entry);
        }
    }
    impl StrokeStrategy for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn init(&self, ctx: &JobContext) -> Result<(), StrokeError> {
            self.push(format!("init@{}", ctx.lod()));
            Ok(())
        }
        fn do_job(&self, _: &JobContext, data: Box<dyn StrokeJobData>) -> Result<(), StrokeError> {
            let step = data.downcast_ref::<Step>().unwrap();
            assert!(!step.panics, "{} asked to panic", step.tag);
            self.push(format!("{}+", step.tag));
            std::thread::sleep(Duration::from_millis(step.delay_ms));
            self.push(format!("{}-", step.tag));
            Ok(())
        }
        fn finish(&self, ctx: &JobContext) -> Result<(), StrokeError> {
            self.push(format!("finish@{}", ctx.lod()));
            Ok(())
        }
        fn cancel(&self, ctx: &JobContext) -> Result<(), StrokeError> {
            self.push(format!("cancel@{}", ctx.lod()));
            Ok(())
        }
        fn create_lod_clone(&self, _level: u32) -> Option<Arc<dyn StrokeStrategy>> {
            self.previews.then(|| {
                Arc::new(Self {
                    log: self.log.clone(),
                    previews: false,
                }) as Arc<dyn StrokeStrategy>
            })
        }
    }

    fn scheduler(lod_level: u32) -> StrokeScheduler {
        StrokeScheduler::new(SchedulerOptions {
            worker_threads: 4,
            lod_level,
        })
        .unwrap()
    }
    fn wait_for(log: &Log, entry: &str) {
        for _ in 0..2000 {
            if log.lock().iter().any(|e| e == entry) {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("{entry} never logged");
    }

    #[test]
    fn barrier_waits_for_concurrent_jobs() {
        let scheduler = scheduler(0);
        let log = Log::default();
        let id = scheduler.start_stroke(Recorder::new(&log)).unwrap();
        scheduler.add_job(id, Step::new("S1", Sequentiality::Sequential, 5)).unwrap();
        scheduler.add_job(id, Step::new("C1", Sequentiality::Concurrent, 30)).unwrap();
        scheduler.add_job(id, Step::new("C2", Sequentiality::Concurrent, 20)).unwrap();
        scheduler.add_job(id, Step::new("B1", Sequentiality::Barrier, 5)).unwrap();
        scheduler.add_job(id, Step::new("S2", Sequentiality::Sequential, 0)).unwrap();
        scheduler.end_stroke(id).unwrap();
        scheduler.wait_for_idle();

        let log = log.lock();
        let at = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert!(at("B1+") > at("C1-"));
        assert!(at("B1+") > at("C2-"));
        assert!(at("B1+") > at("S1-"));
        assert!(at("S2+") > at("B1-"));
        assert_eq!(log.first().map(String::as_str), Some("init@0"));
        assert_eq!(log.last().map(String::as_str), Some("finish@0"));
        assert_eq!(scheduler.stroke_state(id), StrokeState::Done);
    }
    #[test]
    fn one_open_stroke_at_a_time() {
        let scheduler = scheduler(0);
        let log = Log::default();
        let first = scheduler.start_stroke(Recorder::new(&log)).unwrap();
        assert!(matches!(
            scheduler.start_stroke(Recorder::new(&log)),
            Err(SchedulerError::NotMutable(_))
        ));
        scheduler.end_stroke(first).unwrap();
        let second = scheduler.start_stroke(Recorder::new(&log)).unwrap();
        scheduler.end_stroke(second).unwrap();
        scheduler.wait_for_idle();
        assert_eq!(*log.lock(), ["init@0", "finish@0", "init@0", "finish@0"]);
    }
    #[test]
    fn cancel_runs_cancel_callback() {
        let scheduler = scheduler(0);
        let log = Log::default();
        let id = scheduler.start_stroke(Recorder::new(&log)).unwrap();
        scheduler.add_job(id, Step::new("S1", Sequentiality::Sequential, 0)).unwrap();
        wait_for(&log, "S1-");
        scheduler.cancel_stroke(id).unwrap();
        // Dropped, the stroke is closed.
        scheduler.add_job(id, Step::new("late", Sequentiality::Sequential, 0)).unwrap();
        scheduler.wait_for_idle();
        assert_eq!(*log.lock(), ["init@0", "S1+", "S1-", "cancel@0"]);
    }
    #[test]
    fn panicking_job_cancels_stroke() {
        let scheduler = scheduler(0);
        let log = Log::default();
        let id = scheduler.start_stroke(Recorder::new(&log)).unwrap();
        let mut step = Step::new("P", Sequentiality::Sequential, 0);
        step.panics = true;
        scheduler.add_job(id, step).unwrap();
        scheduler.add_job(id, Step::new("S1", Sequentiality::Sequential, 0)).unwrap();
        scheduler.wait_for_idle();
        assert_eq!(*log.lock(), ["init@0", "cancel@0"]);
        assert_eq!(scheduler.stroke_state(id), StrokeState::Done);
        // The failed stroke no longer counts as open.
        let next = scheduler.start_stroke(Recorder::new(&log)).unwrap();
        scheduler.cancel_stroke(next).unwrap();
    }
    #[test]
    fn preview_runs_first() {
        let scheduler = scheduler(2);
        let log = Log::default();
        let synced = log.clone();
        scheduler.set_lod_sync_hook(move |level| synced.lock().push(format!("sync@{level}")));
        let strategy = Arc::new(Recorder {
            log: log.clone(),
            previews: true,
        });
        let id = scheduler.start_stroke(strategy).unwrap();
        scheduler.add_job(id, Step::new("S1", Sequentiality::Sequential, 0)).unwrap();
        scheduler.end_stroke(id).unwrap();
        scheduler.wait_for_idle();
        assert_eq!(
            *log.lock(),
            ["sync@2", "init@2", "S1+", "S1-", "finish@2", "init@0", "S1+", "S1-", "finish@0"]
        );
    }
    #[test]
    fn updates_and_idle_hook() {
        let scheduler = scheduler(0);
        let idles = Arc::new(AtomicUsize::new(0));
        let off_pool = Arc::new(AtomicUsize::new(0));
        let (counter, strays) = (idles.clone(), off_pool.clone());
        scheduler.set_idle_hook(move || {
            if rayon::current_thread_index().is_none() {
                strays.fetch_add(1, Ordering::Relaxed);
            }
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let updates = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let updates = updates.clone();
            scheduler
                .add_update_job(move || {
                    updates.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }
        scheduler.wait_for_idle();
        assert_eq!(updates.load(Ordering::Relaxed), 8);
        // The hook runs after idle is reported.
        for _ in 0..200 {
            if idles.load(Ordering::Relaxed) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(idles.load(Ordering::Relaxed) >= 1);
        assert_eq!(off_pool.load(Ordering::Relaxed), 0);
    }
    #[test]
    fn drop_cancels_open_strokes() {
        let log = Log::default();
        {
            let scheduler = scheduler(0);
            let id = scheduler.start_stroke(Recorder::new(&log)).unwrap();
            scheduler.add_job(id, Step::new("S1", Sequentiality::Sequential, 0)).unwrap();
            wait_for(&log, "S1-");
        }
        assert_eq!(log.lock().last().map(String::as_str), Some("cancel@0"));
    }
}
