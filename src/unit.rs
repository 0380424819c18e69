use crate::{
    scheduler::FrameContext,
    sync::{AtomicU32, Ordering},
};
use core::fmt::Debug;
use std::io;
use thiserror::Error;

/// Per-frame lifecycle of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UnitState {
    /// Ready for this frame; every unit is reset to this value at frame
    /// start.
    NotStarted = 0,
    /// A thread won the acquisition race and is about to run the body.
    Starting = 1,
    /// The body is executing.
    Running = 2,
    /// The body returned successfully this frame.
    Complete = 3,
    /// The body failed this frame, or a predecessor did. Terminal for
    /// the frame; dependents are not started.
    Failed = 4,
}

impl UnitState {
    fn from_word(word: u32) -> Self {
        match word {
            0 => Self::NotStarted,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Complete,
            4 => Self::Failed,
            _ => unreachable!("UnitState::from_word: {word}"),
        }
    }

    /// True once the unit can make no further transition this frame.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Atomic carrier of a unit's [`UnitState`].
///
/// This is the word the whole acquisition protocol synchronizes on. It
/// is public so advanced clients can build their own nodes on the same
/// protocol; the scheduler's own dispatch is the reference user.
#[derive(Debug)]
pub struct StateWord(AtomicU32);

impl Default for StateWord {
    fn default() -> Self {
        Self::new()
    }
}

impl StateWord {
    /// A fresh word in the [`UnitState::NotStarted`] state.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU32::new(UnitState::NotStarted as u32))
    }

    /// Current state, with acquire semantics: a `Complete` observed here
    /// also publishes every write the finishing body performed.
    pub fn load(&self) -> UnitState {
        UnitState::from_word(self.0.load(Ordering::Acquire))
    }

    /// Rewind to [`UnitState::NotStarted`] for the next frame. Only the
    /// scheduler calls this, between frames, so relaxed ordering
    /// suffices.
    pub fn reset(&self) {
        self.0.store(UnitState::NotStarted as u32, Ordering::Relaxed);
    }

    /// The acquisition compare-and-swap. Exactly one caller per frame
    /// observes `true`.
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(
                UnitState::NotStarted as u32,
                UnitState::Starting as u32,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Mark a unit whose predecessor failed, without running its body.
    /// Exactly one caller observes `true`.
    pub fn try_doom(&self) -> bool {
        self.0
            .compare_exchange(
                UnitState::NotStarted as u32,
                UnitState::Failed as u32,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Entered by the acquisition winner immediately before invoking the
    /// body.
    pub fn begin_run(&self) {
        self.0.store(UnitState::Running as u32, Ordering::Relaxed);
    }

    /// Publish success. The release store pairs with the acquire load in
    /// [`load`](StateWord::load): dependents observing `Complete` also
    /// observe all writes performed by the body.
    pub fn complete(&self) {
        self.0.store(UnitState::Complete as u32, Ordering::Release);
    }

    /// Publish failure.
    pub fn fail(&self) {
        self.0.store(UnitState::Failed as u32, Ordering::Release);
    }
}

/// Placement of a unit within the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Drained by any thread during the parallel phase.
    Normal,
    /// Drained only by the main thread.
    MainAffinity,
    /// Run serially on the main thread before the parallel phase;
    /// assumed to saturate the machine internally.
    Monopoly,
    /// A normal node whose body polls a background thread the unit owns
    /// across frames.
    Async,
}

/// Failure reported by a work-unit body. Terminal for the frame: the
/// unit's dependents are not started, and the unit is attempted afresh
/// next frame.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UnitError {
    /// Body-specific failure description.
    #[error("{0}")]
    Failed(String),
    /// I/O failure inside the body.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A unit of computation scheduled once per frame.
///
/// The scheduler owns the unit from registration until removal (or its
/// own destruction) and guarantees the body runs on exactly one thread
/// per frame, only after every predecessor completed. Writes made by a
/// predecessor's body are visible to the bodies of its dependents
/// without further synchronization.
pub trait WorkUnit: Debug + Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "work-unit"
    }

    /// The body. Runs to completion on the thread that acquired the
    /// unit; an `Err` puts the unit in [`UnitState::Failed`] for the
    /// rest of the frame.
    fn run(&mut self, ctx: &FrameContext<'_>) -> Result<(), UnitError>;
}
