use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Error};
use crossbeam_channel::Sender;
use notify::event::{AccessKind, AccessMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::carver::SaveEvent;

/// External collaborator (§1, §4.6): reports paths whose contents changed
/// — specifically, files closed after being opened for writing — under the
/// watched roots. The core only depends on this trait; `NotifyEventSource`
/// is one concrete backing (inotify, via the `notify` crate) for it.
pub trait EventSource: Send {
    /// Block until a changed path is available, or return `None` once the
    /// source is permanently closed (e.g. on shutdown).
    fn next_changed_path(&mut self) -> Option<PathBuf>;
}

/// inotify-backed event source: watches every root recursively and reports
/// a path each time a file under it is closed after being opened writable.
pub struct NotifyEventSource {
    watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
    rx: std::sync::mpsc::Receiver<PathBuf>,
}

/// Handle to stop a [`NotifyEventSource`] from outside the thread that's
/// blocked reading it (§5 "Cancellation"). Dropping the watcher drops the
/// forwarding closure's sender, which is the channel's only sender, so the
/// blocked `recv` unblocks with an error and `next_changed_path` returns
/// `None`.
#[derive(Clone)]
pub struct EventSourceStop(Arc<Mutex<Option<RecommendedWatcher>>>);

impl EventSourceStop {
    pub fn stop(&self) {
        self.0.lock().unwrap().take();
    }
}

impl NotifyEventSource {
    pub fn new(roots: &[PathBuf]) -> Result<Self, Error> {
        let (tx, rx) = std::sync::mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if is_close_write(&event.kind) {
                        for path in event.paths {
                            if tx.send(path).is_err() {
                                // receiver gone; watcher will be dropped soon
                            }
                        }
                    }
                }
                Err(err) => log::warn!("filesystem watch error: {err}"),
            }
        })
        .context("unable to create filesystem watcher")?;

        for root in roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("unable to watch {root:?}"))?;
        }

        Ok(Self {
            watcher: Arc::new(Mutex::new(Some(watcher))),
            rx,
        })
    }

    pub fn stop_handle(&self) -> EventSourceStop {
        EventSourceStop(Arc::clone(&self.watcher))
    }
}

fn is_close_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

impl EventSource for NotifyEventSource {
    fn next_changed_path(&mut self) -> Option<PathBuf> {
        self.rx.recv().ok()
    }
}

/// Runs an [`EventSource`] to completion, pushing every reported path onto
/// the save-queue as a [`SaveEvent`] (§2 data flow, §5 "Event-source"
/// thread).
pub fn run(mut source: impl EventSource, save_tx: Sender<SaveEvent>) {
    while let Some(path) = source.next_changed_path() {
        log::debug!("event source reported change at {path:?}");
        if save_tx.send(SaveEvent { path }).is_err() {
            log::debug!("save queue closed, stopping event source loop");
            break;
        }
    }
}

/// Only used in tests: a source fed from a fixed list of paths, so the
/// Saver pipeline can be exercised without a real inotify watch.
#[cfg(test)]
pub struct FakeEventSource {
    pub paths: std::collections::VecDeque<PathBuf>,
}

#[cfg(test)]
impl EventSource for FakeEventSource {
    fn next_changed_path(&mut self) -> Option<PathBuf> {
        self.paths.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_forwards_every_path_then_stops() {
        let (save_tx, save_rx) = crossbeam_channel::unbounded();
        let source = FakeEventSource {
            paths: vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")].into(),
        };
        run(source, save_tx);
        let received: Vec<_> = save_rx.try_iter().map(|e| e.path).collect();
        assert_eq!(received, vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]);
    }

    #[test]
    fn close_write_classification() {
        assert!(is_close_write(&EventKind::Access(AccessKind::Close(
            AccessMode::Write
        ))));
        assert!(!is_close_write(&EventKind::Access(AccessKind::Close(
            AccessMode::Read
        ))));
        assert!(!is_close_write(&EventKind::Create(
            notify::event::CreateKind::File
        )));
    }
}
