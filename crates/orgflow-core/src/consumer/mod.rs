//! Durable Consumer Loop
//!
//! Pulls batches from a durable subscription, decodes envelopes, routes them
//! and settles every message exactly once: ack on success or permanent
//! failure, nak with a backoff hint on retryable failure, dead-letter once
//! the broker's delivery count reaches the configured maximum.
//!
//! Messages for the same target are handled one at a time in stream order.
//! Different targets run concurrently, bounded by the worker pool. When a
//! message fails with a retryable outcome its target is blocked until that
//! message is redelivered and settled; later messages for the target, in this
//! batch or in later ones, are nak'd back without running. Such deferrals are
//! not held against a message's delivery budget.
//!
//! While a group is waiting or running, its unsettled messages get periodic
//! in-progress signals so slow handlers do not trigger ack-wait redelivery.

use crate::error::{Error, Result};
use crate::event::Event;
use crate::handlers::HandlerOutcome;
use crate::queue::WorkerPool;
use crate::router::subject::dead_letter_subject;
use crate::router::{Dispatch, Router};
use crate::session::{AckHandle, Broker, Delivery, DurableSubscription};
use crate::utils::RetryConfig;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Subject filter for the durable consumer
    pub subject_pattern: String,
    /// Durable consumer name; survives restarts
    pub durable_name: String,
    /// Maximum messages per fetch
    pub batch_size: usize,
    /// How long a fetch waits for the first message
    pub fetch_wait: Duration,
    /// Targets processed concurrently
    pub max_workers: usize,
    /// Deliveries before a retryable failure is dead-lettered
    pub max_deliveries: u32,
    /// Upper bound for one handler invocation
    pub handler_timeout: Duration,
    /// How often unsettled messages are reported as still in progress;
    /// keep it well under the broker's ack wait
    pub progress_interval: Duration,
    /// Time an in-flight batch gets to finish after cancellation
    pub shutdown_grace: Duration,
    /// Nak delay curve, indexed by delivery count
    pub nak_backoff: RetryConfig,
    /// Pause curve after failed fetches
    pub fetch_backoff: RetryConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            subject_pattern: "change.>".to_string(),
            durable_name: "orgflow-controller".to_string(),
            batch_size: 10,
            fetch_wait: Duration::from_secs(5),
            max_workers: 4,
            max_deliveries: 3,
            handler_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(30),
            nak_backoff: RetryConfig::default()
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(60)),
            fetch_backoff: RetryConfig::default()
                .with_initial_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(30)),
        }
    }
}

/// Running counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    fetched: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    deferred: AtomicU64,
    dead_lettered: AtomicU64,
    permanent_failures: AtomicU64,
    malformed: AtomicU64,
    unrouted: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Messages fetched
    pub fetched: u64,
    /// Messages acked, whatever the reason
    pub acked: u64,
    /// Messages nak'd after a retryable failure
    pub nacked: u64,
    /// Messages nak'd unhandled because their target was blocked
    pub deferred: u64,
    /// Messages dead-lettered
    pub dead_lettered: u64,
    /// Handler permanent failures
    pub permanent_failures: u64,
    /// Undecodable envelopes
    pub malformed: u64,
    /// Messages with no matching route
    pub unrouted: u64,
}

impl ConsumerStats {
    /// Copy the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Record published when a message exhausts its deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Subject the message arrived on
    pub subject: String,
    /// Organization
    pub organization: String,
    /// Target
    pub target: String,
    /// Event type
    pub event_type: String,
    /// Handler bound to the subject
    #[serde(default)]
    pub handler: String,
    /// Handler attempts made, the last one included; deferrals excluded
    pub attempts: u32,
    /// Last failure reason
    pub reason: String,
    /// When the message was given up on
    pub dead_lettered_at: DateTime<Utc>,
    /// The original event
    pub event: Event,
}

/// Deferral counts kept per sequence before the oldest are forgotten.
const MAX_TRACKED_DEFERRALS: usize = 10_000;
const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(10);

/// A target waiting for a failed message to come back.
#[derive(Debug, Clone, Copy)]
struct Block {
    sequence: u64,
    /// When the failed message is due for redelivery
    retry_at: Instant,
    /// Give up waiting after this, e.g. when another replica settled it
    expires_at: Instant,
}

/// Ordering state that has to survive from one batch to the next.
#[derive(Debug, Default)]
struct Ledger {
    /// ordering key -> the failed message later ones wait behind
    blocked: HashMap<String, Block>,
    /// sequence -> redeliveries caused by deferral rather than failure
    deferrals: BTreeMap<u64, u32>,
}

type Unsettled = Mutex<BTreeMap<u64, Arc<dyn AckHandle>>>;

/// The consumer loop. Owns every ack/nak decision.
pub struct ConsumerLoop {
    broker: Arc<dyn Broker>,
    router: Arc<Router>,
    config: ConsumerConfig,
    pool: WorkerPool,
    stats: Arc<ConsumerStats>,
    ledger: Mutex<Ledger>,
}

impl ConsumerLoop {
    /// Create a consumer for `router` on `broker`.
    pub fn new(broker: Arc<dyn Broker>, router: Arc<Router>, config: ConsumerConfig) -> Self {
        let pool = WorkerPool::new(config.max_workers);
        Self {
            broker,
            router,
            config,
            pool,
            stats: Arc::new(ConsumerStats::default()),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Share an existing stats block, so counters survive consumer restarts.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<ConsumerStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Counters for this consumer.
    #[must_use]
    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Bind the durable subscription and process until `token` fires.
    ///
    /// Fetch failures are retried with backoff; only fatal errors return.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let subscription = self
            .broker
            .subscribe_durable(&self.config.subject_pattern, &self.config.durable_name)
            .await?;

        info!(
            durable = %self.config.durable_name,
            subject = %self.config.subject_pattern,
            max_workers = self.pool.size(),
            "Consumer started"
        );

        self.run_with(subscription.as_ref(), &token).await?;

        info!(durable = %self.config.durable_name, "Consumer stopped");
        Ok(())
    }

    async fn run_with(
        &self,
        subscription: &dyn DurableSubscription,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut failures: u32 = 0;

        loop {
            let fetched = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                fetched = subscription.fetch(self.config.batch_size, self.config.fetch_wait) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => {
                    failures = 0;
                    batch
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.config.fetch_backoff.delay_for_attempt(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, backing off"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            if batch.is_empty() {
                continue;
            }

            let work = self.process_batch(batch);
            tokio::pin!(work);

            tokio::select! {
                _ = &mut work => {}
                _ = token.cancelled() => {
                    info!(
                        grace_secs = self.config.shutdown_grace.as_secs(),
                        "Shutdown requested, draining in-flight batch"
                    );
                    if tokio::time::timeout(self.config.shutdown_grace, &mut work)
                        .await
                        .is_err()
                    {
                        warn!("Grace period exceeded, unsettled messages will be redelivered");
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Decode, group by target and settle one fetched batch.
    pub async fn process_batch(&self, batch: Vec<Delivery>) {
        self.stats
            .fetched
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        debug!(size = batch.len(), "Processing batch");

        let mut order: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<Vec<(Delivery, Event)>> = Vec::new();

        for delivery in batch {
            let event = match Event::from_payload(&delivery.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        subject = %delivery.subject,
                        delivered = delivery.delivered,
                        error = %e,
                        "Dropping malformed message"
                    );
                    ConsumerStats::bump(&self.stats.malformed);
                    self.ack(delivery).await;
                    continue;
                }
            };

            let idx = *order.entry(event.ordering_key()).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[idx].push((delivery, event));
        }

        join_all(groups.into_iter().map(|group| self.run_group(group))).await;
    }

    async fn run_group(&self, mut group: Vec<(Delivery, Event)>) {
        group.sort_by_key(|(delivery, _)| delivery.sequence);
        let unsettled: Unsettled = Mutex::new(
            group
                .iter()
                .map(|(delivery, _)| (delivery.sequence, delivery.progress_handle()))
                .collect(),
        );

        let work = self.settle_group(group, &unsettled);
        tokio::pin!(work);

        let mut ticker =
            tokio::time::interval(self.config.progress_interval.max(MIN_PROGRESS_INTERVAL));
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut work => break,
                _ = ticker.tick() => self.keep_alive(&unsettled).await,
            }
        }
    }

    async fn keep_alive(&self, unsettled: &Unsettled) {
        let handles: Vec<(u64, Arc<dyn AckHandle>)> = lock(unsettled)
            .iter()
            .map(|(seq, handle)| (*seq, Arc::clone(handle)))
            .collect();
        for (seq, handle) in handles {
            if let Err(e) = handle.in_progress().await {
                debug!(sequence = seq, error = %e, "In-progress signal failed");
            }
        }
    }

    async fn settle_group(&self, group: Vec<(Delivery, Event)>, unsettled: &Unsettled) {
        let _permit = match self.pool.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                // Unsettled messages come back after ack_wait
                warn!(error = %e, "No worker available, leaving group unsettled");
                return;
            }
        };

        for (delivery, event) in group {
            let seq = delivery.sequence;
            let key = event.ordering_key();
            match self.blocked_behind(&key, seq) {
                Some(delay) => self.defer(delivery, &event, delay).await,
                None => self.handle_one(delivery, &event, &key).await,
            }
            lock(unsettled).remove(&seq);
        }
    }

    /// How long `seq` should wait if an earlier message of `key` failed.
    fn blocked_behind(&self, key: &str, seq: u64) -> Option<Duration> {
        let mut ledger = self.ledger();
        let now = Instant::now();
        let block = *ledger.blocked.get(key)?;
        if block.expires_at <= now {
            debug!(ordering_key = %key, sequence = block.sequence, "Block expired");
            ledger.blocked.remove(key);
            return None;
        }
        (seq > block.sequence).then(|| block.retry_at.saturating_duration_since(now))
    }

    fn block(&self, key: &str, seq: u64, delay: Duration) {
        let now = Instant::now();
        let horizon = delay
            + self.config.handler_timeout
            + self.config.fetch_wait
            + self.config.progress_interval * 2;
        self.ledger().blocked.insert(
            key.to_string(),
            Block {
                sequence: seq,
                retry_at: now + delay,
                expires_at: now + horizon,
            },
        );
    }

    /// `seq` is done for good: unblock its target and forget its deferrals.
    fn settled(&self, key: &str, seq: u64) {
        let mut ledger = self.ledger();
        if ledger.blocked.get(key).is_some_and(|b| b.sequence == seq) {
            ledger.blocked.remove(key);
        }
        ledger.deferrals.remove(&seq);
    }

    /// Deliveries that count against the budget.
    fn attempts(&self, delivery: &Delivery) -> u32 {
        let deferred = self
            .ledger()
            .deferrals
            .get(&delivery.sequence)
            .copied()
            .unwrap_or(0);
        delivery.delivered.saturating_sub(deferred).max(1)
    }

    async fn defer(&self, delivery: Delivery, event: &Event, delay: Duration) {
        debug!(
            subject = %delivery.subject,
            target = %event.target,
            sequence = delivery.sequence,
            delay_ms = delay.as_millis() as u64,
            "Deferring behind failed message"
        );
        {
            let mut ledger = self.ledger();
            *ledger.deferrals.entry(delivery.sequence).or_insert(0) += 1;
            while ledger.deferrals.len() > MAX_TRACKED_DEFERRALS {
                ledger.deferrals.pop_first();
            }
        }

        let subject = delivery.subject.clone();
        match delivery.nak(delay).await {
            Ok(()) => ConsumerStats::bump(&self.stats.deferred),
            Err(e) => warn!(subject = %subject, error = %e, "Nak failed, message will be redelivered"),
        }
    }

    async fn handle_one(&self, delivery: Delivery, event: &Event, key: &str) {
        let seq = delivery.sequence;
        let dispatched = tokio::time::timeout(
            self.config.handler_timeout,
            self.router.dispatch(&delivery.subject, event),
        )
        .await;

        let (handler, outcome) = match dispatched {
            Ok(Dispatch::Handled { handler, outcome }) => (handler, outcome),
            Ok(Dispatch::Unrouted) => {
                ConsumerStats::bump(&self.stats.unrouted);
                self.settled(key, seq);
                self.ack(delivery).await;
                return;
            }
            Err(_) => (
                self.router
                    .resolve(&delivery.subject)
                    .unwrap_or("unrouted")
                    .to_string(),
                HandlerOutcome::retryable(format!(
                    "handler timed out after {}ms",
                    self.config.handler_timeout.as_millis()
                )),
            ),
        };

        let attempts = self.attempts(&delivery);
        match outcome {
            HandlerOutcome::Success => {
                self.settled(key, seq);
                self.ack(delivery).await;
            }
            HandlerOutcome::Permanent(reason) => {
                warn!(
                    subject = %delivery.subject,
                    target = %event.target,
                    handler = %handler,
                    reason = %reason,
                    "Handler failed permanently, acknowledging"
                );
                ConsumerStats::bump(&self.stats.permanent_failures);
                self.settled(key, seq);
                self.ack(delivery).await;
            }
            HandlerOutcome::Retryable(reason) if attempts >= self.config.max_deliveries => {
                self.dead_letter(&delivery, event, &handler, attempts, &reason)
                    .await;
                ConsumerStats::bump(&self.stats.dead_lettered);
                self.settled(key, seq);
                self.ack(delivery).await;
            }
            HandlerOutcome::Retryable(reason) => {
                let delay = self.config.nak_backoff.delay_for_attempt(attempts);
                warn!(
                    subject = %delivery.subject,
                    target = %event.target,
                    handler = %handler,
                    attempts = attempts,
                    delivered = delivery.delivered,
                    max_deliveries = self.config.max_deliveries,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Handler failed, requesting redelivery"
                );
                // deferred messages become due no earlier than this one
                self.nak(delivery, delay).await;
                self.block(key, seq, delay);
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        event: &Event,
        handler: &str,
        attempts: u32,
        reason: &str,
    ) {
        error!(
            subject = %delivery.subject,
            target = %event.target,
            handler = %handler,
            attempts = attempts,
            delivered = delivery.delivered,
            reason = %reason,
            "Delivery attempts exhausted, dead-lettering"
        );

        let record = DeadLetter {
            subject: delivery.subject.clone(),
            organization: event.organization.clone(),
            target: event.target.clone(),
            event_type: event.event_type.clone(),
            handler: handler.to_string(),
            attempts,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
            event: event.clone(),
        };

        if let Err(e) = self.publish_dead_letter(&record).await {
            error!(
                subject = %record.subject,
                target = %record.target,
                error = %e,
                "Failed to publish dead letter record"
            );
        }
    }

    async fn publish_dead_letter(&self, record: &DeadLetter) -> Result<()> {
        let subject = dead_letter_subject(&record.organization, &record.event_type)?;
        let payload = serde_json::to_vec(record).map_err(Error::from)?;
        self.broker.publish(&subject, payload, None).await?;
        Ok(())
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        lock(&self.ledger)
    }

    async fn ack(&self, delivery: Delivery) {
        let subject = delivery.subject.clone();
        match delivery.ack().await {
            Ok(()) => ConsumerStats::bump(&self.stats.acked),
            Err(e) => warn!(subject = %subject, error = %e, "Ack failed, message will be redelivered"),
        }
    }

    async fn nak(&self, delivery: Delivery, delay: Duration) {
        let subject = delivery.subject.clone();
        match delivery.nak(delay).await {
            Ok(()) => ConsumerStats::bump(&self.stats.nacked),
            Err(e) => warn!(subject = %subject, error = %e, "Nak failed, message will be redelivered"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // state stays consistent across a panicking holder
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests;
