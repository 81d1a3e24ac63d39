use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SUBMISSIONS_ACCEPTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_submissions_accepted_total",
        "Total submissions accepted and enqueued"
    ))
    .unwrap();
    pub static ref SUBMISSIONS_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_submissions_rejected_total",
        "Total submissions rejected by validation or device lookup"
    ))
    .unwrap();
    pub static ref PUBLISH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_publish_failures_total",
        "Total submissions the message channel refused"
    ))
    .unwrap();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages received from the message channel"
    ))
    .unwrap();
    pub static ref PERSISTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_persisted_total",
        "Total readings persisted"
    ))
    .unwrap();
    pub static ref POISON_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_poison_messages_total",
        "Total undecodable or invalid messages skipped"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total database write failures"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to persist one reading"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref CACHE_HITS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_cache_hits_total",
        "Total device lookups served from cache"
    ))
    .unwrap();
    pub static ref CACHE_MISSES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_cache_misses_total",
        "Total device lookups that fell through to the store"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(SUBMISSIONS_ACCEPTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SUBMISSIONS_REJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PUBLISH_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PERSISTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POISON_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
