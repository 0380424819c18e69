use crate::{
    scheduler::FrameContext,
    unit::{UnitError, WorkUnit},
};

/// Re-sorts the dispatch sequences from fresh runtime averages.
///
/// Sorting inside a frame keeps the cost off the frame-start critical
/// path: the result is staged, and the scheduler adopts it when the
/// next frame begins (unless the graph changed in between, in which
/// case the full cache rebuild wins).
#[derive(Debug, Default)]
pub struct WorkUnitSorter;

impl WorkUnitSorter {
    /// A sorter unit.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl WorkUnit for WorkUnitSorter {
    fn name(&self) -> &str {
        "work-unit-sorter"
    }

    fn run(&mut self, ctx: &FrameContext<'_>) -> Result<(), UnitError> {
        ctx.restage_dispatch_order();
        Ok(())
    }
}
