use std::sync::atomic::{AtomicU64, Ordering};

use cdp_api_types::StatsInfo;

/// Process-wide request/byte/file counters backing `/Stats.json` (§6.5
/// ambient observability). Plain atomics: the server never needs a
/// consistent snapshot across the three counters, only monotonically
/// increasing totals.
#[derive(Default)]
pub struct Stats {
    requests: AtomicU64,
    bytes: AtomicU64,
    files: AtomicU64,
}

impl Stats {
    pub fn record_request(&self, body_len: usize) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(body_len as u64, Ordering::Relaxed);
    }

    pub fn record_file_saved(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsInfo {
        StatsInfo {
            requests: self.requests.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_calls() {
        let stats = Stats::default();
        stats.record_request(10);
        stats.record_request(5);
        stats.record_file_saved();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.bytes, 15);
        assert_eq!(snapshot.files, 1);
    }
}
