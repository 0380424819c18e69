#![allow(missing_docs)]
#![cfg(feature = "loom")]

use framedag::unit::{StateWord, UnitState};
use loom::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

#[derive(Debug)]
struct SyncCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for SyncCell<T> {}

#[test]
fn acquisition_has_exactly_one_winner() {
    loom::model(|| {
        let state = Arc::new(StateWord::new());
        let wins = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let state = Arc::clone(&state);
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    if state.try_acquire() {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::Relaxed), 1);
        assert_eq!(state.load(), UnitState::Starting);
    });
}

#[test]
fn acquire_and_doom_are_mutually_exclusive() {
    loom::model(|| {
        let state = Arc::new(StateWord::new());
        let transitions = Arc::new(AtomicUsize::new(0));

        let acquirer = {
            let state = Arc::clone(&state);
            let transitions = Arc::clone(&transitions);
            thread::spawn(move || {
                if state.try_acquire() {
                    transitions.fetch_add(1, Ordering::Relaxed);
                }
            })
        };
        let doomer = {
            let state = Arc::clone(&state);
            let transitions = Arc::clone(&transitions);
            thread::spawn(move || {
                if state.try_doom() {
                    transitions.fetch_add(1, Ordering::Relaxed);
                }
            })
        };
        acquirer.join().unwrap();
        doomer.join().unwrap();

        // Exactly one thread moved the unit out of NotStarted.
        assert_eq!(transitions.load(Ordering::Relaxed), 1);
        assert!(matches!(
            state.load(),
            UnitState::Starting | UnitState::Failed
        ));
    });
}

#[test]
fn completion_publishes_body_writes() {
    loom::model(|| {
        let state = Arc::new(StateWord::new());
        let payload = Arc::new(SyncCell(UnsafeCell::new(0u64)));

        let producer = {
            let state = Arc::clone(&state);
            let payload = Arc::clone(&payload);
            thread::spawn(move || {
                assert!(state.try_acquire());
                state.begin_run();
                payload.0.with_mut(|slot| unsafe { *slot = 42 });
                state.complete();
            })
        };
        let consumer = {
            let state = Arc::clone(&state);
            let payload = Arc::clone(&payload);
            thread::spawn(move || {
                // A dependent that observes Complete must also observe
                // every write the body performed.
                if state.load() == UnitState::Complete {
                    payload.0.with(|slot| assert_eq!(unsafe { *slot }, 42));
                }
            })
        };
        producer.join().unwrap();
        consumer.join().unwrap();
    });
}

#[test]
fn failure_publishes_like_completion() {
    loom::model(|| {
        let state = Arc::new(StateWord::new());
        let payload = Arc::new(SyncCell(UnsafeCell::new(0u64)));

        let producer = {
            let state = Arc::clone(&state);
            let payload = Arc::clone(&payload);
            thread::spawn(move || {
                assert!(state.try_acquire());
                state.begin_run();
                payload.0.with_mut(|slot| unsafe { *slot = 7 });
                state.fail();
            })
        };
        let observer = {
            let state = Arc::clone(&state);
            let payload = Arc::clone(&payload);
            thread::spawn(move || {
                if state.load() == UnitState::Failed {
                    payload.0.with(|slot| assert_eq!(unsafe { *slot }, 7));
                }
            })
        };
        producer.join().unwrap();
        observer.join().unwrap();
    });
}
