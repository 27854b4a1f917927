use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Rolling totals for one class of timed byte transfer a stream performs,
/// such as chunk downloads or sample decodes: how many, how many bytes, and
/// the total / worst-case latency.
#[derive(Debug, Default)]
pub struct TransferStats {
    count: AtomicU64,
    bytes: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl TransferStats {
    pub fn record(&self, bytes: u64, elapsed: Duration) {
        let ns = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);

        let mut seen = self.max_ns.load(Ordering::Relaxed);
        while ns > seen {
            match self
                .max_ns
                .compare_exchange_weak(seen, ns, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(now) => seen = now,
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            count: self.count.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            total_ns: self.total_ns.load(Ordering::Relaxed),
            max_ns: self.max_ns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferSnapshot {
    pub count: u64,
    pub bytes: u64,
    pub total_ns: u64,
    pub max_ns: u64,
}

impl TransferSnapshot {
    pub fn avg_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_ns / self.count
        }
    }

    /// Mean transfer rate over the recorded wall time.
    pub fn bytes_per_sec(&self) -> u64 {
        if self.total_ns == 0 {
            return 0;
        }
        let scaled = u128::from(self.bytes) * 1_000_000_000u128 / u128::from(self.total_ns);
        scaled.min(u128::from(u64::MAX)) as u64
    }
}

/// Depth of the chunk-fetch window a stream currently has open, and the
/// deepest it has ever been. The high-water mark is what proves the bounded
/// window stayed bounded.
#[derive(Debug, Default)]
pub struct InflightWindow {
    current: AtomicU64,
    high_water: AtomicU64,
}

impl InflightWindow {
    /// A fetch entered the window; returns the new depth.
    pub fn enter(&self) -> u64 {
        let depth = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        let mut seen = self.high_water.load(Ordering::Relaxed);
        while depth > seen {
            match self.high_water.compare_exchange_weak(
                seen,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(now) => seen = now,
            }
        }
        depth
    }

    /// A fetch left the window. Floors at zero so a double exit cannot wrap
    /// the depth around.
    pub fn exit(&self) {
        let mut seen = self.current.load(Ordering::Relaxed);
        loop {
            let next = seen.saturating_sub(1);
            match self
                .current
                .compare_exchange_weak(seen, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(now) => seen = now,
            }
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn high_water(&self) -> u64 {
        self.high_water.load(Ordering::Relaxed)
    }
}

/// Event counters for one consuming stream, bumped by the prefetch pipeline
/// and the cache path as they go.
#[derive(Debug, Default)]
pub struct StreamCounters {
    chunks_downloaded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    samples_delivered: AtomicU64,
}

impl StreamCounters {
    pub fn chunk_downloaded(&self) {
        self.chunks_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sample_delivered(&self) {
        self.samples_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunks_downloaded(&self) -> u64 {
        self.chunks_downloaded.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn samples_delivered(&self) -> u64 {
        self.samples_delivered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_stats_aggregate_bytes_and_latency() {
        let stats = TransferStats::default();
        stats.record(1024, Duration::from_millis(2));
        stats.record(2048, Duration::from_millis(8));

        let snap = stats.snapshot();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.bytes, 3072);
        assert!(snap.max_ns >= 8_000_000);
        assert!(snap.avg_ns() >= 4_000_000);
        assert!(snap.bytes_per_sec() > 0);
    }

    #[test]
    fn empty_snapshot_divides_safely() {
        let snap = TransferStats::default().snapshot();
        assert_eq!(snap.avg_ns(), 0);
        assert_eq!(snap.bytes_per_sec(), 0);
    }

    #[test]
    fn inflight_window_tracks_depth_and_high_water() {
        let window = InflightWindow::default();
        assert_eq!(window.enter(), 1);
        assert_eq!(window.enter(), 2);
        window.exit();
        assert_eq!(window.enter(), 2);
        assert_eq!(window.high_water(), 2);

        window.exit();
        window.exit();
        window.exit();
        assert_eq!(window.current(), 0, "exit floors at zero");
        assert_eq!(window.high_water(), 2);
    }

    #[test]
    fn stream_counters_split_hits_from_misses() {
        let counters = StreamCounters::default();
        counters.cache_lookup(true);
        counters.cache_lookup(false);
        counters.cache_lookup(false);
        counters.chunk_downloaded();
        counters.sample_delivered();

        assert_eq!(counters.cache_hits(), 1);
        assert_eq!(counters.cache_misses(), 2);
        assert_eq!(counters.chunks_downloaded(), 1);
        assert_eq!(counters.samples_delivered(), 1);
    }
}
