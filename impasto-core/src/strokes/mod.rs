//! # Strokes
//!
//! A stroke is one cancellable, undoable operation on the image, made of jobs. Its behavior is a
//! [`StrokeStrategy`]; the [`StrokeScheduler`] decides when each job may run.
//!
//! Within a stroke, jobs start in the order they were added, but may overlap as their
//! [`Sequentiality`] allows. Jobs of the next stroke don't start before the previous stroke is
//! done. [`Exclusivity::Exclusive`] jobs run alone on the whole image.

mod events;
mod job;
mod queue;
mod scheduler;
mod strategy;
mod undo_bridge;

pub use events::{EventSink, StrokeEvent};
pub use job::{CancellationToken, Exclusivity, JobContext, Sequentiality, StrokeJobData};
pub(crate) use job::Job;
pub use scheduler::{SchedulerError, SchedulerOptions, StrokeScheduler};
pub use strategy::{StrokeError, StrokeStrategy};
pub use undo_bridge::UndoBridge;

/// Namespace of stroke ids.
pub enum Stroke {}
pub type StrokeId = crate::id::UniqueId<Stroke>;

/// Execution state of a stroke.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum StrokeState {
    /// Waiting for earlier strokes.
    Queued,
    Active,
    /// Ended, remaining jobs and the finish callback still to run.
    Finishing,
    /// Reverting. Only jobs that can't be dropped still run before the cancel callback.
    Cancelling,
    Done,
}
