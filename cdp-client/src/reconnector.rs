use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::http_client::HttpClient;
use crate::local_cache::LocalCache;

/// Periodically probes the server and drains the unsent-requests buffer
/// (§4.6). Runs on its own thread; `stop` is flipped by the main thread
/// during shutdown so the sleep loop exits promptly (§5 "Cancellation").
pub struct Reconnector {
    http: Arc<HttpClient>,
    cache: Arc<LocalCache>,
    interval: Duration,
    stop: Arc<AtomicBool>,
}

impl Reconnector {
    pub fn new(
        http: Arc<HttpClient>,
        cache: Arc<LocalCache>,
        interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            http,
            cache,
            interval,
            stop,
        }
    }

    pub fn run(&self) {
        while !self.stop.load(Ordering::Relaxed) {
            if self.cache.has_unsent().unwrap_or(false) && self.http.get_version().is_some() {
                match self.drain_once() {
                    Ok(n) if n > 0 => log::info!("reconnector drained {n} buffered request(s)"),
                    Ok(_) => {}
                    Err(err) => log::warn!("reconnector drain pass failed: {err:#}"),
                }
            }
            self.sleep_unless_stopped();
        }
    }

    fn drain_once(&self) -> Result<usize, anyhow::Error> {
        self.cache.drain_unsent(|endpoint, payload| {
            Ok(self.http.replay_buffered(endpoint, payload))
        })
    }

    fn sleep_unless_stopped(&self) {
        let step = Duration::from_millis(250);
        let mut waited = Duration::ZERO;
        while waited < self.interval {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(step);
            waited += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn drain_once_replays_through_closure() {
        let cache = Arc::new(LocalCache::open(":memory:").unwrap());
        cache.buffer_unsent("/Meta.json", b"{}").unwrap();

        let calls = AtomicUsize::new(0);
        let drained = cache
            .drain_unsent(|_endpoint, _payload| {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            })
            .unwrap();
        assert_eq!(drained, 1);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(!cache.has_unsent().unwrap());
    }
}
