use std::sync::Arc;

use anyhow::Error;
use cdp_datastore::ChunkStore;
use crossbeam_channel::{Receiver, Sender};
use tokio::sync::oneshot;

/// One unit of datastore work, queued by an async request handler and run
/// on a worker thread (§5 "two worker threads drain internal metadata/data
/// queues and call the object store"). The closure already serializes its
/// own success value, so the worker pool stays generic over every handler's
/// response type.
struct Job {
    run: Box<dyn FnOnce(&ChunkStore) -> Result<Vec<u8>, Error> + Send>,
    reply: oneshot::Sender<Result<Vec<u8>, Error>>,
}

/// A fixed pool of threads, each owning a reference to the shared
/// `ChunkStore`, draining one shared job queue (§5 "Handlers never block on
/// per-client state" — the async connection-handling layer only ever
/// enqueues and awaits, it never touches the store directly).
#[derive(Clone)]
pub struct Workers {
    job_tx: Sender<Job>,
}

impl Workers {
    pub fn spawn(store: Arc<ChunkStore>, worker_count: usize) -> Self {
        let (job_tx, job_rx): (Sender<Job>, Receiver<Job>) = crossbeam_channel::unbounded();

        for i in 0..worker_count {
            let store = Arc::clone(&store);
            let job_rx = job_rx.clone();
            std::thread::Builder::new()
                .name(format!("datastore-worker-{i}"))
                .spawn(move || {
                    for job in job_rx.iter() {
                        let result = (job.run)(&store);
                        let _ = job.reply.send(result);
                    }
                })
                .expect("unable to spawn datastore worker thread");
        }

        Self { job_tx }
    }

    /// Enqueue `run` and await its result from the async caller's side.
    pub async fn submit<F>(&self, run: F) -> Result<Vec<u8>, Error>
    where
        F: FnOnce(&ChunkStore) -> Result<Vec<u8>, Error> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            run: Box::new(run),
            reply,
        };
        if self.job_tx.send(job).is_err() {
            anyhow::bail!("datastore worker pool is gone");
        }
        rx.await.map_err(|_| anyhow::format_err!("datastore worker dropped the reply channel"))?
    }
}
