use tracing::Span;
use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "STRATA_LOG";
const FORMAT_ENV: &str = "STRATA_LOG_FORMAT";
const DEFAULT_FILTER: &str = "info";

/// Output shape of the subscriber installed by `init_tracing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-oriented single-line text.
    #[default]
    Text,
    /// One JSON object per record with event fields flattened to top-level
    /// keys, for log pipelines that index on `event` / `chunk_id` / `rank`.
    Json,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "text" | "plain" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }

    fn from_env() -> Self {
        std::env::var(FORMAT_ENV)
            .ok()
            .as_deref()
            .and_then(Self::parse)
            .unwrap_or_default()
    }
}

/// Installs the process-wide subscriber for strata binaries. Library crates
/// never install one.
///
/// The filter comes from `STRATA_LOG`, then `RUST_LOG`, then `info`; the
/// format from `STRATA_LOG_FORMAT` (`text` | `json`). Machine-parseable
/// events are emitted at `target: "strata_flow"` with an `event` field;
/// per-stream context (`rank`, `worker`, `epoch`) and per-producer context
/// (`node_rank`, `worker`) attach through the spans below rather than being
/// repeated at every call site.
pub fn init_tracing() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true);
    match LogFormat::from_env() {
        LogFormat::Json => builder.json().flatten_event(true).init(),
        LogFormat::Text => builder.init(),
    }
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Span one consuming stream runs under for an epoch. Every download, cache,
/// and delivery event inside it carries the stream coordinates, which is the
/// field contract assignment-related records must honor.
pub fn stream_span(rank: u32, worker: u32, epoch: u32) -> Span {
    tracing::info_span!("stream", rank, worker, epoch)
}

/// Span one optimize worker runs under for the life of its shard.
pub fn producer_span(node_rank: u32, worker: u32) -> Span {
    tracing::info_span!("producer", node_rank, worker)
}
