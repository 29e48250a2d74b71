use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use crossbeam_channel::{Receiver, Sender};
use walkdir::WalkDir;

/// One entry discovered during carving, pushed onto the save-queue for the
/// Saver thread to run the send protocol on (§4.4, §4.5).
#[derive(Clone, Debug)]
pub struct SaveEvent {
    pub path: PathBuf,
}

/// Depth-first traversal of the configured roots (§4.5).
///
/// The initial pass performs a full recursive walk of every root. After
/// that, the Carver blocks on the directory-queue: whenever the Saver
/// confirms an entry is a directory it pushes that path back here, and the
/// Carver lists just its immediate children and re-enqueues them as save
/// events — this is what picks up directories created after the initial
/// scan completed, without re-walking everything that hasn't changed.
pub struct Carver {
    roots: Vec<PathBuf>,
    save_tx: Sender<SaveEvent>,
    dir_rx: Receiver<PathBuf>,
    stop: Arc<AtomicBool>,
}

impl Carver {
    pub fn new(
        roots: Vec<PathBuf>,
        save_tx: Sender<SaveEvent>,
        dir_rx: Receiver<PathBuf>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            roots,
            save_tx,
            dir_rx,
            stop,
        }
    }

    /// Runs the initial full walk, then services the directory-queue until
    /// `stop` is set (§5 "Cancellation"). The directory-queue has a sender
    /// living inside the Saver for as long as it runs, so waiting for it to
    /// close naturally would deadlock against the Saver waiting on us; an
    /// explicit stop flag, polled the way `Reconnector` polls its own,
    /// breaks that cycle.
    pub fn run(&self) {
        for root in &self.roots {
            if let Err(err) = self.walk_recursive(root) {
                log::warn!("error carving root {root:?}: {err:#}");
            }
        }

        while !self.stop.load(Ordering::Relaxed) {
            match self.dir_rx.recv_timeout(Duration::from_millis(250)) {
                Ok(dir) => {
                    if let Err(err) = self.walk_one_level(&dir) {
                        log::warn!("error recursing into {dir:?}: {err:#}");
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn walk_recursive(&self, root: &Path) -> Result<(), Error> {
        for entry in WalkDir::new(root).into_iter() {
            match entry {
                Ok(entry) => self.push(entry.path()),
                Err(err) => log::warn!("carve error under {root:?}: {err}"),
            }
        }
        Ok(())
    }

    fn walk_one_level(&self, dir: &Path) -> Result<(), Error> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("unable to read directory {dir:?}: {err}");
                return Ok(());
            }
        };
        for entry in entries {
            match entry {
                Ok(entry) => self.push(&entry.path()),
                Err(err) => log::warn!("carve error listing {dir:?}: {err}"),
            }
        }
        Ok(())
    }

    fn push(&self, path: &Path) {
        if self
            .save_tx
            .send(SaveEvent {
                path: path.to_path_buf(),
            })
            .is_err()
        {
            log::debug!("save queue closed, dropping carve event for {path:?}");
        }
    }
}
