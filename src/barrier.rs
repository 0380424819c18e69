use parking_lot::{Condvar, Mutex};

/// An N-party reusable rendezvous.
///
/// [`wait`](Barrier::wait) blocks until the Nth caller arrives, then all
/// N proceed. The barrier is reusable without reset: the generation
/// counter prevents early arrivers of the next cycle from being released
/// by the previous one.
#[derive(Debug)]
pub struct Barrier {
    state: Mutex<BarrierState>,
    condvar: Condvar,
    parties: usize,
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

impl Barrier {
    /// Create a rendezvous for `parties` callers.
    ///
    /// # Panics
    /// If `parties` is zero.
    #[must_use]
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "Barrier::new: zero parties");
        Self {
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            condvar: Condvar::new(),
            parties,
        }
    }

    /// Block until `parties` callers have arrived at this cycle.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.condvar.notify_all();
            return;
        }
        while state.generation == generation {
            self.condvar.wait(&mut state);
        }
    }
}

/// Epoch gate that releases persistent workers into a frame.
///
/// The main thread bumps the epoch once per frame; workers park until
/// the epoch moves past the one they last ran. A broadcast gate, unlike
/// a second barrier, releases however many workers exist, which keeps
/// shutdown and partial-spawn teardown deadlock-free.
#[derive(Debug)]
pub(crate) struct FrameGate {
    epoch: Mutex<u64>,
    condvar: Condvar,
}

impl FrameGate {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// The current epoch; freshly spawned workers snapshot this before
    /// their first wait.
    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Release every waiter into the next epoch.
    pub(crate) fn open(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.condvar.notify_all();
    }

    /// Block until the epoch moves past `seen`; returns the new epoch.
    pub(crate) fn wait_past(&self, seen: u64) -> u64 {
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            self.condvar.wait(&mut epoch);
        }
        *epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    #[test]
    fn barrier_releases_all_parties() {
        let barrier = Arc::new(Barrier::new(4));
        let arrived = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let arrived = Arc::clone(&arrived);
                thread::spawn(move || {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    barrier.wait();
                })
            })
            .collect();
        barrier.wait();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(arrived.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn barrier_is_reusable_across_cycles() {
        let barrier = Arc::new(Barrier::new(2));
        let cycles = Arc::new(AtomicUsize::new(0));
        let handle = {
            let barrier = Arc::clone(&barrier);
            let cycles = Arc::clone(&cycles);
            thread::spawn(move || {
                for _ in 0..100 {
                    barrier.wait();
                    cycles.fetch_add(1, Ordering::SeqCst);
                    barrier.wait();
                }
            })
        };
        for cycle in 0..100 {
            barrier.wait();
            barrier.wait();
            // After the second rendezvous the peer must have counted
            // this cycle; a generation mix-up would let it run ahead or
            // fall behind.
            assert_eq!(cycles.load(Ordering::SeqCst), cycle + 1);
        }
        handle.join().unwrap();
    }

    #[test]
    fn single_party_barrier_never_blocks() {
        let barrier = Barrier::new(1);
        for _ in 0..10 {
            barrier.wait();
        }
    }

    #[test]
    fn gate_releases_waiters_on_open() {
        let gate = Arc::new(FrameGate::new());
        let released = Arc::new(AtomicUsize::new(0));
        let seen = gate.epoch();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let released = Arc::clone(&released);
                thread::spawn(move || {
                    let next = gate.wait_past(seen);
                    released.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(next, seen + 1);
                })
            })
            .collect();
        gate.open();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gate_returns_immediately_once_the_epoch_has_passed() {
        let gate = FrameGate::new();
        gate.open();
        let current = gate.epoch();
        assert_eq!(gate.wait_past(current.wrapping_sub(1)), current);
    }
}
