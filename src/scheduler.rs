//! The frame scheduler: registry ownership, worker-thread lifecycle,
//! per-frame dispatch, and end-of-frame pacing.

mod dispatch;
mod registry;

pub use dispatch::FrameContext;
/// Error kind for structurally invalid graphs (cycles, dangling or
/// self-referential handles), surfaced at the offending call.
pub use registry::GraphError;

use crate::{
    barrier::{Barrier, FrameGate},
    buffer::ParityFlip,
    config::{SchedulerConfig, WorkerModel},
    key::UnitKey,
    types::UnitId,
    unit::{UnitKind, WorkUnit},
};
use core::num::NonZeroUsize;
use parking_lot::{Mutex, RwLock};
use registry::{Registry, StagedOrders};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};

/// Error surfaced by scheduler lifecycle calls. Work-unit body failures
/// are not errors at this level; they end the unit's frame in the
/// failed state while the frame itself completes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// A worker thread could not be spawned; the scheduler is left in a
    /// well-defined unstarted state.
    #[error("failed to spawn worker thread")]
    Spawn(#[source] io::Error),
    /// The client-visible graph is invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Per-frame metrics returned by
/// [`do_one_frame`](FrameScheduler::do_one_frame).
#[derive(Debug, Clone, Copy)]
pub struct FrameReport {
    /// 1-based index of the frame just executed.
    pub frame: u64,
    /// Wall clock from frame start to the end of the parallel phase. An
    /// `elapsed` beyond the target frame length is not an error; the
    /// overshoot is absorbed by the carry.
    pub elapsed: Duration,
    /// Realized end-of-frame pause.
    pub slept: Duration,
    /// Carry applied to the next frame's pause, in microseconds.
    pub carry_us: i64,
    /// Units that ended the frame in the failed state.
    pub failed_units: usize,
}

/// State shared with worker threads and scheduler handles.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) registry: RwLock<Registry>,
    pub(crate) gate: FrameGate,
    pub(crate) running: AtomicBool,
    pub(crate) staged: Mutex<Option<StagedOrders>>,
    /// End of the current pause as microseconds since `epoch`; zero
    /// while not pausing.
    pause_until_us: AtomicU64,
    epoch: Instant,
}

impl Shared {
    fn new(registry: Registry) -> Self {
        Self {
            registry: RwLock::new(registry),
            gate: FrameGate::new(),
            running: AtomicBool::new(false),
            staged: Mutex::new(None),
            pause_until_us: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub(crate) fn pause_remaining(&self) -> Duration {
        let until = self.pause_until_us.load(Ordering::Relaxed);
        if until == 0 {
            return Duration::ZERO;
        }
        let now = u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX);
        Duration::from_micros(until.saturating_sub(now))
    }

    fn set_pause(&self, pause: Duration) {
        let now = u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX);
        let pause = u64::try_from(pause.as_micros()).unwrap_or(u64::MAX);
        let until = now.saturating_add(pause).max(1);
        self.pause_until_us.store(until, Ordering::Relaxed);
    }

    fn clear_pause(&self) {
        self.pause_until_us.store(0, Ordering::Relaxed);
    }
}

/// Cloneable handle onto a live scheduler, usable from any thread.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Time left in the end-of-frame pause; zero outside it.
    /// Asynchronous units' background threads use this to bound how much
    /// work they take on before the next frame begins.
    #[must_use]
    pub fn pause_remaining(&self) -> Duration {
        self.shared.pause_remaining()
    }
}

#[derive(Debug)]
struct WorkerPool {
    threads: Vec<thread::JoinHandle<()>>,
    end: Arc<Barrier>,
    size: usize,
}

/// The frame scheduler.
///
/// Owns every registered work unit from registration to removal or its
/// own destruction, executes the whole registry once per call to
/// [`do_one_frame`](FrameScheduler::do_one_frame), and paces frames
/// toward the configured target length.
///
/// Graph mutation takes `&mut self`, so "legal only between frames" is
/// enforced by the borrow checker rather than at runtime: no graph call
/// can overlap a frame in flight.
#[must_use]
#[derive(Debug)]
pub struct FrameScheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    pool: Option<WorkerPool>,
    carry_us: i64,
    frame_index: u64,
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScheduler {
    /// A scheduler with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// A scheduler with an explicit configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        let registry = Registry::new(config.history_length.get());
        Self {
            shared: Arc::new(Shared::new(registry)),
            config,
            pool: None,
            carry_us: 0,
            frame_index: 0,
        }
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a work unit; returns its stable handle.
    pub fn add_work_unit(&mut self, unit: Box<dyn WorkUnit>, kind: UnitKind) -> UnitId {
        self.shared.registry.write().insert(unit, kind)
    }

    /// Record that `dependent` must not start before `predecessor`
    /// completed, within every frame. Marks the dependency cache dirty.
    pub fn add_dependency(
        &mut self,
        dependent: UnitId,
        predecessor: UnitId,
    ) -> Result<(), GraphError> {
        self.shared
            .registry
            .write()
            .add_dependency(dependent, predecessor)
    }

    /// Unregister a unit, filtering it out of the survivors' dependency
    /// lists. Returns the unit so its owner can tear it down.
    pub fn remove_work_unit(&mut self, id: UnitId) -> Result<Box<dyn WorkUnit>, GraphError> {
        self.shared.registry.write().remove(id)
    }

    /// Rebuild the derived dependency structures: reverse edges,
    /// transitive dependent counts, and the sorted dispatch sequences.
    pub fn update_dependency_cache(&mut self) -> Result<(), GraphError> {
        self.shared.staged.lock().take();
        self.shared.registry.write().rebuild()
    }

    /// Order the dispatch sequences. With `rebuild_cache` (or a dirty
    /// cache) the derived structures are rebuilt first; otherwise the
    /// sequences are re-sorted from cached dependent counts and fresh
    /// runtime averages.
    pub fn sort_work_units(&mut self, rebuild_cache: bool) -> Result<(), GraphError> {
        let mut registry = self.shared.registry.write();
        if rebuild_cache || registry.is_dirty() {
            self.shared.staged.lock().take();
            registry.rebuild()
        } else {
            registry.resort();
            Ok(())
        }
    }

    /// The sorted dispatch sequence (affinity entries first) as
    /// `(handle, key)` pairs.
    #[must_use]
    pub fn dispatch_sequence(&self) -> Vec<(UnitId, UnitKey)> {
        self.shared.registry.read().dispatch_sequence()
    }

    /// Register a double-buffered resource for the frame-start parity
    /// flip.
    pub fn add_resource(&mut self, resource: Arc<dyn ParityFlip>) {
        self.shared.registry.write().add_resource(resource);
    }

    /// Reconfigure the worker count. Persistent workers are torn down
    /// and respawned on the next frame.
    pub fn set_thread_count(&mut self, thread_count: NonZeroUsize) {
        if thread_count != self.config.thread_count {
            self.shutdown_pool();
            self.config.thread_count = thread_count;
        }
    }

    /// Reconfigure the target frame length.
    ///
    /// # Panics
    /// If `frame_length_us` is zero.
    pub fn set_frame_length_us(&mut self, frame_length_us: u64) {
        assert!(
            frame_length_us > 0,
            "FrameScheduler::set_frame_length_us: zero frame length"
        );
        self.config.frame_length = Duration::from_micros(frame_length_us);
    }

    /// Reconfigure the runtime history window. Existing samples are
    /// discarded.
    pub fn set_history_length(&mut self, history_length: NonZeroUsize) {
        self.config.history_length = history_length;
        self.shared
            .registry
            .write()
            .reset_histories(history_length.get());
    }

    /// Time left in the end-of-frame pause; zero outside it.
    #[must_use]
    pub fn pause_remaining(&self) -> Duration {
        self.shared.pause_remaining()
    }

    /// A cloneable handle usable from any thread.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(Arc::clone(&self.shared))
    }

    /// Execute exactly one frame end-to-end, blocking until the
    /// end-of-frame pause has elapsed.
    pub fn do_one_frame(&mut self) -> Result<FrameReport, SchedulerError> {
        let frame_start = Instant::now();
        self.frame_index += 1;

        {
            let mut registry = self.shared.registry.write();
            if registry.is_dirty() {
                self.shared.staged.lock().take();
                registry.rebuild()?;
            } else if let Some(orders) = self.shared.staged.lock().take() {
                registry.apply_staged(orders);
            }
            registry.ensure_thread_logs(self.config.thread_count.get());
            registry.reset_frame(self.config.cache_flush_optimization);
        }

        {
            let registry = self.shared.registry.read();
            dispatch::run_monopolies(&registry, &self.shared);
        }

        let mut spawn_error = None;
        match self.config.worker_model {
            WorkerModel::Persistent => {
                self.ensure_pool()?;
                if let Some(pool) = &self.pool {
                    self.shared.gate.open();
                    {
                        let registry = self.shared.registry.read();
                        dispatch::drain(&registry, &self.shared, dispatch::Lane::Main, 0);
                    }
                    pool.end.wait();
                } else {
                    let registry = self.shared.registry.read();
                    dispatch::drain(&registry, &self.shared, dispatch::Lane::Main, 0);
                }
            }
            WorkerModel::PerFrame => {
                let workers = self.config.thread_count.get() - 1;
                thread::scope(|scope| {
                    for worker_index in 1..=workers {
                        let shared = &self.shared;
                        let spawned = thread::Builder::new()
                            .name(format!("framedag-worker-{worker_index}"))
                            .spawn_scoped(scope, move || {
                                let registry = shared.registry.read();
                                dispatch::drain(&registry, shared, dispatch::Lane::Rest, worker_index);
                            });
                        if let Err(error) = spawned {
                            warn!(%error, "worker spawn failed, frame continues short-handed");
                            spawn_error = Some(error);
                            break;
                        }
                    }
                    let registry = self.shared.registry.read();
                    dispatch::drain(&registry, &self.shared, dispatch::Lane::Main, 0);
                });
            }
        }

        let elapsed = frame_start.elapsed();
        let target = self.config.frame_length;
        let deficit_us = duration_us(target) - duration_us(elapsed);
        let planned_us = deficit_us + self.carry_us;
        let mut slept = Duration::ZERO;
        if planned_us > 0 {
            let pause = Duration::from_micros(planned_us as u64);
            self.shared.set_pause(pause);
            let before = Instant::now();
            thread::sleep(pause);
            slept = before.elapsed();
            self.shared.clear_pause();
        }
        self.carry_us = (deficit_us - duration_us(slept)).clamp(-duration_us(target), duration_us(target));

        let failed_units = self.shared.registry.read().failed_units();
        debug!(
            frame = self.frame_index,
            elapsed_us = duration_us(elapsed),
            slept_us = duration_us(slept),
            carry_us = self.carry_us,
            failed_units,
            "frame complete"
        );
        if let Some(error) = spawn_error {
            return Err(SchedulerError::Spawn(error));
        }
        Ok(FrameReport {
            frame: self.frame_index,
            elapsed,
            slept,
            carry_us: self.carry_us,
            failed_units,
        })
    }

    fn ensure_pool(&mut self) -> Result<(), SchedulerError> {
        let parties = self.config.thread_count.get();
        if let Some(pool) = &self.pool {
            if pool.size == parties {
                return Ok(());
            }
        }
        self.shutdown_pool();
        if parties == 1 {
            return Ok(());
        }

        let end = Arc::new(Barrier::new(parties));
        let base_epoch = self.shared.gate.epoch();
        self.shared.running.store(true, Ordering::SeqCst);
        let mut threads = Vec::with_capacity(parties - 1);
        let mut failure = None;
        for worker_index in 1..parties {
            let shared = Arc::clone(&self.shared);
            let end = Arc::clone(&end);
            let spawned = thread::Builder::new()
                .name(format!("framedag-worker-{worker_index}"))
                .spawn(move || dispatch::worker_loop(shared, end, base_epoch, worker_index));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        if let Some(error) = failure {
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.gate.open();
            for handle in threads {
                if handle.join().is_err() {
                    warn!("worker thread panicked during teardown");
                }
            }
            return Err(SchedulerError::Spawn(error));
        }
        self.pool = Some(WorkerPool {
            threads,
            end,
            size: parties,
        });
        Ok(())
    }

    fn shutdown_pool(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.gate.open();
        for handle in pool.threads {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.shutdown_pool();
    }
}

fn duration_us(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}
