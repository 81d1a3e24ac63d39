//! Consume-and-persist loop.
//!
//! ```text
//! Stopped -> Subscribing -> Polling -> Processing -> Polling -> ... -> Draining -> Stopped
//! ```
//!
//! A message is acknowledged only after its reading was persisted, or when it
//! can never be persisted (undecodable or out of bounds). A failed write
//! releases the message so the next poll returns it again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelConsumer, Delivery};
use crate::errors::Error;
use crate::metrics::{INGEST_LATENCY_SECONDS, MESSAGES_TOTAL, PERSISTED_TOTAL, POISON_MESSAGES_TOTAL};
use crate::model::TelemetryMessage;
use crate::store::TelemetryStore;
use crate::validate::validate_message;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;
const DRAIN_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Subscribing,
    Polling,
    Processing,
    Draining,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long an in-flight message may take once shutdown was requested.
    pub drain_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Re-check value bounds on consumed messages.
    pub revalidate: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(DRAIN_TIMEOUT_SECS),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            revalidate: true,
        }
    }
}

impl WorkerConfig {
    fn backoff(&self, failures: u32) -> Duration {
        let factor = 2_u32.saturating_pow(failures.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub persisted: u64,
    pub skipped: u64,
    pub retried: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Persisted,
    Skipped,
    Retry,
}

impl WorkerStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Persisted => self.persisted += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Retry => self.retried += 1,
        }
    }
}

pub struct IngestWorker<C> {
    name: String,
    consumer: C,
    store: Arc<dyn TelemetryStore>,
    config: WorkerConfig,
    state: watch::Sender<WorkerState>,
    stats: WorkerStats,
}

impl<C: ChannelConsumer> IngestWorker<C> {
    pub fn new(
        name: impl Into<String>,
        consumer: C,
        store: Arc<dyn TelemetryStore>,
        config: WorkerConfig,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Stopped);
        Self {
            name: name.into(),
            consumer,
            store,
            config,
            state,
            stats: WorkerStats::default(),
        }
    }

    /// Observes state transitions.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Runs until `cancel` fires, then finishes the in-flight message (bounded
    /// by the drain timeout) and returns the counters.
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerStats {
        info!(worker = %self.name, "Starting ingest worker");

        if self.subscribe(&cancel).await {
            self.consume(&cancel).await;
        }

        self.state.send_replace(WorkerState::Draining);
        info!(
            worker = %self.name,
            persisted = self.stats.persisted,
            skipped = self.stats.skipped,
            retried = self.stats.retried,
            "Ingest worker stopped"
        );
        self.state.send_replace(WorkerState::Stopped);
        self.stats
    }

    async fn subscribe(&mut self, cancel: &CancellationToken) -> bool {
        self.state.send_replace(WorkerState::Subscribing);
        let mut failures = 0;

        loop {
            match self.consumer.subscribe().await {
                Ok(()) => return true,
                Err(e) => {
                    failures += 1;
                    let delay = self.config.backoff(failures);
                    warn!(worker = %self.name, "Subscribe failed: {}. Retrying in {:?}", e, delay);
                    if !pause(cancel, delay).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn consume(&mut self, cancel: &CancellationToken) {
        let drain_timeout = self.config.drain_timeout;
        let mut poll_failures = 0;
        let mut persist_failures = 0;

        loop {
            self.state.send_replace(WorkerState::Polling);

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.consumer.poll() => polled,
            };

            let delivery = match polled {
                Ok(delivery) => {
                    poll_failures = 0;
                    delivery
                }
                Err(Error::ChannelClosed) => {
                    error!(worker = %self.name, "Message channel closed, stopping");
                    break;
                }
                Err(e) => {
                    poll_failures += 1;
                    let delay = self.config.backoff(poll_failures);
                    warn!(worker = %self.name, "Poll failed: {}. Retrying in {:?}", e, delay);
                    if !pause(cancel, delay).await {
                        break;
                    }
                    continue;
                }
            };

            self.state.send_replace(WorkerState::Processing);
            MESSAGES_TOTAL.inc();

            let processing = process(
                &mut self.consumer,
                self.store.as_ref(),
                &self.config,
                &self.name,
                delivery,
            );
            tokio::pin!(processing);

            let outcome = tokio::select! {
                outcome = &mut processing => outcome,
                _ = cancel.cancelled() => {
                    self.state.send_replace(WorkerState::Draining);
                    info!(worker = %self.name, "Shutdown requested, finishing in-flight message");
                    match tokio::time::timeout(drain_timeout, &mut processing).await {
                        Ok(outcome) => self.stats.record(outcome),
                        Err(_) => warn!(
                            worker = %self.name,
                            "Drain timeout of {:?} elapsed; in-flight message left unacknowledged",
                            drain_timeout
                        ),
                    }
                    break;
                }
            };
            self.stats.record(outcome);

            if outcome == Outcome::Retry {
                persist_failures += 1;
                let delay = self.config.backoff(persist_failures);
                if !pause(cancel, delay).await {
                    break;
                }
            } else {
                persist_failures = 0;
            }
        }
    }
}

/// Sleeps for `delay`; returns false if cancelled first.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn process<C: ChannelConsumer>(
    consumer: &mut C,
    store: &dyn TelemetryStore,
    config: &WorkerConfig,
    worker: &str,
    delivery: Delivery,
) -> Outcome {
    let message = match serde_json::from_slice::<TelemetryMessage>(&delivery.payload) {
        Ok(message) => message,
        Err(e) => {
            POISON_MESSAGES_TOTAL.inc();
            warn!(%worker, key = %delivery.key, "Skipping undecodable message: {}", e);
            acknowledge(consumer, &delivery, worker).await;
            return Outcome::Skipped;
        }
    };

    if config.revalidate {
        if let Err(errors) = validate_message(&message) {
            POISON_MESSAGES_TOTAL.inc();
            warn!(%worker, key = %delivery.key, "Skipping invalid message: {}", errors);
            acknowledge(consumer, &delivery, worker).await;
            return Outcome::Skipped;
        }
    }

    let start = Instant::now();
    match store.append(&message).await {
        Ok(id) => {
            INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
            PERSISTED_TOTAL.inc();
            debug!(%worker, %id, device_id = %message.device_id, "Reading persisted");
            acknowledge(consumer, &delivery, worker).await;
            Outcome::Persisted
        }
        Err(e) => {
            error!(
                %worker,
                device_id = %message.device_id,
                "Failed to persist reading, leaving it for redelivery: {}",
                e
            );
            if let Err(e) = consumer.release(delivery).await {
                warn!(%worker, "Failed to release message: {}", e);
            }
            Outcome::Retry
        }
    }
}

async fn acknowledge<C: ChannelConsumer>(consumer: &mut C, delivery: &Delivery, worker: &str) {
    // The reading is already durable; a lost ack only means a duplicate later.
    if let Err(e) = consumer.ack(delivery).await {
        warn!(%worker, "Failed to acknowledge message: {}", e);
    }
}
