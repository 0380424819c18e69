//! Work units that own a thread across frames.
//!
//! An asynchronous unit is an ordinary node in the graph: its scheduled
//! body runs once per frame like any other and spends that time polling
//! or steering the background thread the unit owns. The background
//! thread itself lives across frames and is expected to lean on I/O
//! rather than CPU, working through the end-of-frame pause.

use crate::unit::WorkUnit;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use tracing::warn;

/// Join-on-drop handle to a unit's background thread.
#[derive(Debug)]
pub struct BackgroundThread {
    handle: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl BackgroundThread {
    /// Spawn a named background thread. The closure receives the stop
    /// flag and should wind down promptly once it is raised.
    pub fn spawn(
        name: &str,
        body: impl FnOnce(Arc<AtomicBool>) + Send + 'static,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(flag))?;
        Ok(Self {
            handle: Some(handle),
            stop,
        })
    }

    /// Raise the stop flag without waiting for the thread to exit.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// True once the thread has run to completion.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(thread::JoinHandle::is_finished)
    }
}

impl Drop for BackgroundThread {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("background thread panicked");
            }
        }
    }
}

/// A work unit that owns a long-lived background thread, polled each
/// frame by its scheduled body.
pub trait AsyncWorkUnit: WorkUnit {
    /// The thread this unit owns.
    fn background(&self) -> &BackgroundThread;

    /// True once the background work has drained.
    fn is_finished(&self) -> bool {
        self.background().is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn background_thread_runs_and_reports_finished() {
        let ran = Arc::new(AtomicBool::new(false));
        let witness = Arc::clone(&ran);
        let background = BackgroundThread::spawn("test-background", move |_stop| {
            witness.store(true, Ordering::SeqCst);
        })
        .unwrap();
        while !background.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_stops_and_joins_a_looping_thread() {
        let background = BackgroundThread::spawn("test-loop", |stop| {
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        assert!(!background.is_finished());
        drop(background);
    }
}
