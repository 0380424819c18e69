use crate::{
    async_unit::{AsyncWorkUnit, BackgroundThread},
    scheduler::FrameContext,
    types::HashMap,
    unit::{UnitError, WorkUnit},
};
use crossbeam_channel::Receiver;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::Ordering,
};

type Completion = (PathBuf, io::Result<Vec<u8>>);

/// Loads a fixed set of files on a background thread the unit owns.
///
/// The background thread reads the files one by one and sends each
/// completion over a channel; the scheduled body drains completions
/// each frame. File contents keep arriving through the end-of-frame
/// pause, when the machine would otherwise idle.
#[derive(Debug)]
pub struct AsyncFileLoader {
    background: BackgroundThread,
    completions: Receiver<Completion>,
    loaded: HashMap<PathBuf, Vec<u8>>,
    failed: Vec<(PathBuf, io::Error)>,
    expected: usize,
}

impl AsyncFileLoader {
    /// Start loading `paths` immediately.
    pub fn new(paths: Vec<PathBuf>) -> io::Result<Self> {
        let (sender, completions) = crossbeam_channel::unbounded();
        let expected = paths.len();
        let background = BackgroundThread::spawn("framedag-file-loader", move |stop| {
            for path in paths {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let bytes = fs::read(&path);
                if sender.send((path, bytes)).is_err() {
                    break;
                }
            }
        })?;
        Ok(Self {
            background,
            completions,
            loaded: HashMap::default(),
            failed: Vec::new(),
            expected,
        })
    }

    /// True once every requested file has loaded or failed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.loaded.len() + self.failed.len() == self.expected
    }

    /// Contents of a loaded file.
    #[must_use]
    pub fn bytes(&self, path: &Path) -> Option<&[u8]> {
        self.loaded.get(path).map(Vec::as_slice)
    }

    /// Take ownership of a loaded file's contents.
    pub fn take(&mut self, path: &Path) -> Option<Vec<u8>> {
        self.loaded.remove(path)
    }

    /// Files that could not be read.
    #[must_use]
    pub fn failures(&self) -> &[(PathBuf, io::Error)] {
        &self.failed
    }
}

impl WorkUnit for AsyncFileLoader {
    fn name(&self) -> &str {
        "async-file-loader"
    }

    fn run(&mut self, ctx: &FrameContext<'_>) -> Result<(), UnitError> {
        for (path, outcome) in self.completions.try_iter() {
            match outcome {
                Ok(bytes) => {
                    ctx.log(format_args!(
                        "loaded {} ({} bytes)",
                        path.display(),
                        bytes.len()
                    ));
                    self.loaded.insert(path, bytes);
                }
                Err(error) => {
                    ctx.log(format_args!("failed to load {}: {error}", path.display()));
                    self.failed.push((path, error));
                }
            }
        }
        Ok(())
    }
}

impl AsyncWorkUnit for AsyncFileLoader {
    fn background(&self) -> &BackgroundThread {
        &self.background
    }
}
