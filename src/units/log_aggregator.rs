use crate::{
    scheduler::FrameContext,
    unit::{UnitError, WorkUnit},
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Forwards every thread's previous-frame log buffer to the logging
/// sink.
///
/// Work-unit bodies write lines through
/// [`FrameContext::log`](crate::scheduler::FrameContext::log) into their
/// thread's double-buffered log; one frame later this unit reads the
/// flipped buffers and emits the lines. Because it only touches
/// *previous* buffers it can run on any thread, concurrently with units
/// still logging into their *current* ones.
#[derive(Debug, Default)]
pub struct LogAggregator {
    sink: Option<Arc<Mutex<String>>>,
}

impl LogAggregator {
    /// An aggregator that forwards through `tracing` only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also mirror every aggregated line into `sink`.
    #[must_use]
    pub fn with_sink(sink: Arc<Mutex<String>>) -> Self {
        Self { sink: Some(sink) }
    }
}

impl WorkUnit for LogAggregator {
    fn name(&self) -> &str {
        "log-aggregator"
    }

    fn run(&mut self, ctx: &FrameContext<'_>) -> Result<(), UnitError> {
        for thread_index in 0..ctx.thread_count() {
            let log = ctx.previous_log(thread_index);
            if log.is_empty() {
                continue;
            }
            for line in log.lines() {
                info!(target: "framedag::log", thread = thread_index, "{line}");
            }
            if let Some(sink) = &self.sink {
                sink.lock().push_str(log);
            }
        }
        Ok(())
    }
}
