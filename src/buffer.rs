use crate::types::SyncUnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

/// Double-buffered storage: two slots plus a parity bit.
///
/// Within one frame the *current* slot is written only by its owning
/// thread and the *previous* slot is read-only to every thread. The
/// scheduler flips the parity exactly once per frame, before any unit
/// runs; the end-of-frame rendezvous orders a frame's writers before the
/// next frame's readers, so the payload needs no further
/// synchronization.
///
/// Producers write into their own `current`; consumers read a
/// producer's `previous`, or its `current` when ordered after it by a
/// dependency edge within the same frame.
#[derive(Debug)]
pub struct DoubleBuffered<T> {
    slots: [SyncUnsafeCell<T>; 2],
    parity: AtomicBool,
}

impl<T: Default> Default for DoubleBuffered<T> {
    fn default() -> Self {
        Self::new(T::default(), T::default())
    }
}

impl<T> DoubleBuffered<T> {
    /// Create the resource with `current` as the first writable slot and
    /// `previous` as the first readable one.
    pub fn new(current: T, previous: T) -> Self {
        Self {
            slots: [SyncUnsafeCell::new(current), SyncUnsafeCell::new(previous)],
            parity: AtomicBool::new(false),
        }
    }

    /// Raw pointer to the current (writable) slot.
    ///
    /// Dereferencing is sound only on the owning thread, between the
    /// frame-start flip and the end-of-frame rendezvous.
    pub fn current(&self) -> *mut T {
        self.slots[self.current_index()].get()
    }

    /// Raw pointer to the previous (read-only) slot.
    ///
    /// Dereferencing shared is sound for any thread during the frame; no
    /// thread may write through it until the next flip.
    pub fn previous(&self) -> *const T {
        self.slots[1 - self.current_index()].get()
    }

    /// Exclusive access to the current slot.
    pub fn current_mut(&mut self) -> &mut T {
        let index = self.current_index();
        self.slots[index].get_mut()
    }

    /// Exclusive access to the previous slot.
    pub fn previous_mut(&mut self) -> &mut T {
        let index = 1 - self.current_index();
        self.slots[index].get_mut()
    }

    /// Swap the roles of the two slots.
    ///
    /// Called exactly once per frame by the scheduler, while no unit is
    /// running; the frame boundary provides the ordering, so the parity
    /// itself needs no stronger ordering than relaxed.
    pub fn flip(&self) {
        self.parity.fetch_xor(true, Ordering::Relaxed);
    }

    fn current_index(&self) -> usize {
        usize::from(self.parity.load(Ordering::Relaxed))
    }
}

/// Object-safe flip, letting the scheduler hold a heterogeneous list of
/// registered resources for its frame-start pass.
pub trait ParityFlip: Send + Sync {
    /// Swap the resource's current and previous slots.
    fn flip_parity(&self);
}

impl<T: Send + Sync> ParityFlip for DoubleBuffered<T> {
    fn flip_parity(&self) {
        self.flip();
    }
}
