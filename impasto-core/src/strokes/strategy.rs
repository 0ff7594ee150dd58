use std::sync::Arc;

use super::{Exclusivity, JobContext, StrokeJobData};
use crate::{device::DeviceError, undo::UndoError};

#[derive(thiserror::Error, Debug)]
pub enum StrokeError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Undo(#[from] UndoError),
}

/// Behavior of one kind of stroke.
///
/// Callbacks are invoked from worker threads. `init` runs before any user job, `finish` or
/// `cancel` after all of them, each as a barrier within the stroke. Data jobs may run
/// concurrently with each other, as their [`StrokeJobData::sequentiality`] allows.
///
/// An `Err` from any callback but `cancel` cancels the stroke.
pub trait StrokeStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn init_exclusivity(&self) -> Exclusivity {
        Exclusivity::Normal
    }
    fn finish_exclusivity(&self) -> Exclusivity {
        Exclusivity::Normal
    }
    fn cancel_exclusivity(&self) -> Exclusivity {
        Exclusivity::Normal
    }

    fn init(&self, ctx: &JobContext) -> Result<(), StrokeError> {
        let _ = ctx;
        Ok(())
    }
    fn do_job(&self, ctx: &JobContext, data: Box<dyn StrokeJobData>) -> Result<(), StrokeError>;
    fn finish(&self, ctx: &JobContext) -> Result<(), StrokeError> {
        let _ = ctx;
        Ok(())
    }
    /// Must leave the image as it was before the stroke.
    fn cancel(&self, ctx: &JobContext) -> Result<(), StrokeError> {
        let _ = ctx;
        Ok(())
    }

    /// A strategy running the same stroke on the preview plane of LOD `level`, or `None` if this
    /// stroke can't be previewed.
    fn create_lod_clone(&self, level: u32) -> Option<Arc<dyn StrokeStrategy>> {
        let _ = level;
        None
    }
}
