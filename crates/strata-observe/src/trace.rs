use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

/// One Chrome Trace Event (`ph = "X"` complete events only).
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: &'static str,
    pub ph: &'static str,
    /// Microseconds since profiler start.
    pub ts: u64,
    /// Duration in microseconds.
    pub dur: u64,
    pub pid: u32,
    pub tid: u32,
}

/// Collects complete spans and writes them as a Chrome Trace Event JSON
/// array, loadable in `chrome://tracing` / Perfetto.
#[derive(Debug)]
pub struct TraceProfiler {
    origin: Instant,
    events: Mutex<Vec<TraceEvent>>,
    pid: u32,
}

impl TraceProfiler {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            events: Mutex::new(Vec::new()),
            pid: std::process::id(),
        }
    }

    /// Starts a span; the returned guard records a complete event on drop.
    pub fn span(&self, name: &'static str, tid: u32) -> TraceSpan<'_> {
        TraceSpan {
            profiler: self,
            name,
            tid,
            start: Instant::now(),
        }
    }

    fn record(&self, name: &'static str, tid: u32, start: Instant) {
        let ts = start
            .duration_since(self.origin)
            .as_micros()
            .min(u64::MAX as u128) as u64;
        let dur = start.elapsed().as_micros().min(u64::MAX as u128) as u64;
        if let Ok(mut events) = self.events.lock() {
            events.push(TraceEvent {
                name,
                ph: "X",
                ts,
                dur,
                pid: self.pid,
                tid,
            });
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let events = self
            .events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default();
        serde_json::to_string(&events)
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}

impl Default for TraceProfiler {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TraceSpan<'a> {
    profiler: &'a TraceProfiler,
    name: &'static str,
    tid: u32,
    start: Instant,
}

impl Drop for TraceSpan<'_> {
    fn drop(&mut self) {
        self.profiler.record(self.name, self.tid, self.start);
    }
}
