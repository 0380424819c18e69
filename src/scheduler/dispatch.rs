use crate::{
    barrier::Barrier,
    scheduler::{
        registry::{DispatchEntry, Registry, Slot},
        SchedulerHandle, Shared,
    },
    sync::Ordering,
    unit::UnitState,
};
use core::fmt::Display;
use std::{
    fmt::Write as _,
    panic::{self, AssertUnwindSafe},
    sync::{atomic::Ordering as AtomicOrdering, Arc},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

/// Which dispatch sequences a draining thread can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    /// The main thread: affinity entries first, then the rest.
    Main,
    /// A worker: the non-affinity sequence only.
    Rest,
}

/// Per-frame view handed to a running work-unit body.
#[derive(Debug)]
pub struct FrameContext<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) shared: &'a Arc<Shared>,
    pub(crate) thread_index: usize,
}

impl FrameContext<'_> {
    /// Index of the executing thread: 0 is the main thread, workers
    /// count up from 1.
    #[must_use]
    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    /// Number of threads participating in this frame.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.registry.thread_count()
    }

    /// Append a line to this thread's log buffer. The built-in
    /// [`LogAggregator`](crate::units::LogAggregator) forwards every
    /// buffer to the logging sink one frame later.
    pub fn log(&self, line: impl Display) {
        let buffer = self.registry.thread_log(self.thread_index);
        // SAFETY: each thread writes only its own current buffer, and
        // only between the frame-start flip and the end-of-frame
        // rendezvous.
        let buffer = unsafe { buffer.current().as_mut().expect("FrameContext::log") };
        let _ = writeln!(buffer, "{line}");
    }

    /// The log lines `thread_index` produced last frame.
    #[must_use]
    pub fn previous_log(&self, thread_index: usize) -> &str {
        let buffer = self.registry.thread_log(thread_index);
        // SAFETY: previous slots are read-only for the duration of the
        // frame.
        unsafe {
            buffer
                .previous()
                .as_ref()
                .expect("FrameContext::previous_log")
        }
    }

    /// A handle onto the scheduler that outlives this frame; background
    /// threads of asynchronous units hold one to watch the pause.
    #[must_use]
    pub fn scheduler(&self) -> SchedulerHandle {
        SchedulerHandle::new(Arc::clone(self.shared))
    }

    /// Time left in the end-of-frame pause; zero outside it.
    #[must_use]
    pub fn pause_remaining(&self) -> Duration {
        self.shared.pause_remaining()
    }

    /// Re-sort the dispatch sequences from current runtime averages and
    /// stage the result; the scheduler adopts it at the next frame
    /// start. The built-in
    /// [`WorkUnitSorter`](crate::units::WorkUnitSorter) is a thin
    /// wrapper around this.
    pub fn restage_dispatch_order(&self) {
        *self.shared.staged.lock() = Some(self.registry.build_orders());
    }
}

enum PredStatus {
    /// Every predecessor is complete.
    Ready,
    /// Some predecessor has not reached a terminal state.
    Waiting,
    /// A predecessor failed; the unit cannot run this frame.
    Doomed,
}

fn predecessor_status(registry: &Registry, idx: u16) -> PredStatus {
    let mut status = PredStatus::Ready;
    for &pred in registry.preds(idx) {
        match registry.slot(pred).state.load() {
            UnitState::Complete => {}
            UnitState::Failed => return PredStatus::Doomed,
            _ => status = PredStatus::Waiting,
        }
    }
    status
}

/// Run one acquired unit: publish `Running`, invoke the body, fold the
/// runtime into the unit's history, publish the terminal state.
fn execute_slot(registry: &Registry, shared: &Arc<Shared>, slot: &Slot, thread_index: usize) {
    slot.state.begin_run();
    let ctx = FrameContext {
        registry,
        shared,
        thread_index,
    };
    // SAFETY: the acquisition CAS granted this thread exclusive access
    // to the body until a terminal state is published.
    let body = unsafe { slot.body.get().as_mut().expect("dispatch::execute_slot") };
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body.unit.run(&ctx)));
    let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    body.history.record(elapsed_us);
    slot.avg_us
        .store(body.history.average(), Ordering::Relaxed);
    match outcome {
        Ok(Ok(())) => slot.state.complete(),
        Ok(Err(error)) => {
            warn!(unit = slot.id.get(), name = body.unit.name(), %error, "work unit failed");
            slot.state.fail();
        }
        Err(_) => {
            warn!(
                unit = slot.id.get(),
                name = body.unit.name(),
                "work unit panicked"
            );
            slot.state.fail();
        }
    }
}

/// Run every monopoly unit to completion, serially, in registration
/// order.
pub(crate) fn run_monopolies(registry: &Registry, shared: &Arc<Shared>) {
    let indices: Vec<u16> = registry.monopoly_indices().collect();
    for idx in indices {
        let slot = registry.slot(idx);
        if slot.state.try_acquire() {
            execute_slot(registry, shared, slot, 0);
        }
    }
}

/// One scan over a lane's dispatch entries. Returns whether every
/// visible unit is terminal and whether this pass made progress.
fn pass<'a>(
    registry: &Registry,
    shared: &Arc<Shared>,
    entries: impl Iterator<Item = &'a DispatchEntry>,
    thread_index: usize,
) -> (bool, bool) {
    let mut all_terminal = true;
    let mut progressed = false;
    for entry in entries {
        let slot = registry.slot(entry.idx);
        match slot.state.load() {
            UnitState::Complete | UnitState::Failed => continue,
            UnitState::Starting | UnitState::Running => {
                all_terminal = false;
                continue;
            }
            UnitState::NotStarted => {}
        }
        all_terminal = false;
        match predecessor_status(registry, entry.idx) {
            PredStatus::Waiting => {}
            PredStatus::Doomed => {
                if slot.state.try_doom() {
                    debug!(
                        unit = slot.id.get(),
                        "predecessor failed, unit skipped this frame"
                    );
                    progressed = true;
                }
            }
            PredStatus::Ready => {
                if slot.state.try_acquire() {
                    execute_slot(registry, shared, slot, thread_index);
                    progressed = true;
                }
            }
        }
    }
    (all_terminal, progressed)
}

/// Drain a lane until every visible unit reached a terminal state.
///
/// The scan never blocks; a fruitless pass spins briefly, degrading to
/// an OS yield once the thread has gone a while without progress.
pub(crate) fn drain(registry: &Registry, shared: &Arc<Shared>, lane: Lane, thread_index: usize) {
    let mut idle_passes = 0u32;
    loop {
        let (all_terminal, progressed) = match lane {
            Lane::Main => pass(
                registry,
                shared,
                registry.order_main().iter().chain(registry.order_rest()),
                thread_index,
            ),
            Lane::Rest => pass(registry, shared, registry.order_rest().iter(), thread_index),
        };
        if all_terminal {
            break;
        }
        if progressed {
            idle_passes = 0;
            continue;
        }
        idle_passes += 1;
        if idle_passes < 16 {
            for _ in 0..32 {
                core::hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
    }
}

/// Body of a persistent worker: park on the frame gate, drain the
/// non-affinity lane, meet the main thread at the end barrier, repeat.
pub(crate) fn worker_loop(
    shared: Arc<Shared>,
    end: Arc<Barrier>,
    mut seen_epoch: u64,
    worker_index: usize,
) {
    trace!(worker = worker_index, "worker started");
    loop {
        seen_epoch = shared.gate.wait_past(seen_epoch);
        if !shared.running.load(AtomicOrdering::SeqCst) {
            break;
        }
        {
            let registry = shared.registry.read();
            drain(&registry, &shared, Lane::Rest, worker_index);
        }
        end.wait();
    }
    trace!(worker = worker_index, "worker exiting");
}
