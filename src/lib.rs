//! Deterministic per-frame DAG work scheduler for soft-real-time
//! applications.
//!
//! This crate executes a static set of work units, related by a directed
//! acyclic dependency graph, once per frame across a pool of worker
//! threads, pacing each frame to a configured target duration. It:
//! - Keeps the registry and dependency cache read-only while a frame is
//!   in flight, so threads pick their own work without a shared queue
//!   lock.
//! - Moves all per-unit synchronization onto a single atomic state word:
//!   threads acquire a unit with one compare-and-swap, and a release
//!   store on completion publishes the body's writes to every dependent.
//! - Orders execution by a sort key derived from transitive dependent
//!   counts and observed runtimes, so the most depended-on, longest
//!   running work starts earliest and the critical path stays short.
//! - Replaces most cross-thread locking with dependency edges and
//!   double-buffered per-thread resources that flip at the frame
//!   boundary.
//!
//! Key modules:
//! - `scheduler`: the [`FrameScheduler`](scheduler::FrameScheduler):
//!   registry ownership, worker lifecycle, per-frame dispatch, pacing.
//! - `unit`: the [`WorkUnit`](unit::WorkUnit) trait, unit kinds, and the
//!   atomic state machine behind the acquisition protocol.
//! - `buffer`: [`DoubleBuffered`](buffer::DoubleBuffered) per-thread
//!   paired storage with frame-boundary parity flips.
//! - `barrier`: the N-party reusable rendezvous the worker pool meets
//!   at.
//! - `units`: built-in work units (log aggregation, dispatch re-sorting,
//!   asynchronous file loading) exercising the framework as ordinary
//!   nodes.
//!
//! Quick start:
//! 1. Implement [`WorkUnit`](unit::WorkUnit) for each piece of per-frame
//!    work.
//! 2. Register the units with
//!    [`add_work_unit`](scheduler::FrameScheduler::add_work_unit) and
//!    relate them with
//!    [`add_dependency`](scheduler::FrameScheduler::add_dependency).
//! 3. Call [`do_one_frame`](scheduler::FrameScheduler::do_one_frame)
//!    from the main loop.
//!
//! For any dependency edge, all memory writes performed by the
//! predecessor's body happen-before every read performed by the
//! dependent's body; between units with no path in the graph, no
//! ordering is implied.

/// Work units that own a background thread across frames.
pub mod async_unit;
/// The N-party reusable rendezvous and the persistent-worker frame gate.
pub mod barrier;
/// Double-buffered per-thread storage with commit/flip semantics.
pub mod buffer;
/// Scheduler configuration: thread count, frame length, history window,
/// worker model.
pub mod config;
/// The sort record ordering the dispatch sequence.
pub mod key;
/// Fixed-window smoothing of work-unit runtimes.
pub mod rolling;
/// The frame scheduler and its per-frame dispatch.
pub mod scheduler;
mod sync;
/// Handles and common aliases.
pub mod types;
/// The `WorkUnit` trait and its per-frame state machine.
pub mod unit;
/// Built-in work units.
pub mod units;
