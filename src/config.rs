use core::num::NonZeroUsize;
use std::{thread, time::Duration};

/// How the scheduler obtains worker threads for the parallel phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerModel {
    /// Workers are spawned once and parked on a frame gate between
    /// frames. Lowest per-frame overhead; the default.
    #[default]
    Persistent,
    /// Fresh workers are spawned for the parallel phase of every frame
    /// and joined at its end.
    PerFrame,
}

/// Runtime configuration of a
/// [`FrameScheduler`](crate::scheduler::FrameScheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Logical workers used for the parallel phase, counting the main
    /// thread. Defaults to the machine's available parallelism.
    pub thread_count: NonZeroUsize,
    /// Target frame duration. Defaults to one 60 Hz frame.
    pub frame_length: Duration,
    /// Runtime samples retained per unit for the performance average.
    pub history_length: NonZeroUsize,
    /// Worker thread lifecycle model.
    pub worker_model: WorkerModel,
    /// Hint: skip the frame-start warming pass over unit state words.
    /// Worth enabling on registries too large for the warming pass to
    /// pay for itself. No semantic effect.
    pub cache_flush_optimization: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_count: thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            frame_length: Duration::from_micros(16_667),
            history_length: NonZeroUsize::new(8).expect("SchedulerConfig::default: [1]"),
            worker_model: WorkerModel::default(),
            cache_flush_optimization: false,
        }
    }
}
