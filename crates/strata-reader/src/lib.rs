#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod assigner;
pub mod cache;
pub mod dataset;
pub mod mixer;
pub mod pipeline;

use std::sync::Arc;

use strata_observe::metrics::{InflightWindow, StreamCounters, TransferStats};

/// Process-local metrics for one reader stream.
#[derive(Debug, Default)]
pub struct ReaderMetrics {
    pub stream: StreamCounters,
    pub inflight: InflightWindow,
    pub downloads: TransferStats,
    pub decodes: TransferStats,
}

pub type SharedReaderMetrics = Arc<ReaderMetrics>;
