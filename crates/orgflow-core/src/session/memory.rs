//! In-process broker.
//!
//! Mirrors the JetStream behaviours the controller relies on: an append-only
//! log, idempotency-key dedup inside a window, durable consumers that resume
//! from their last position, per-message delivery counts, nak-with-delay and
//! ack-wait redelivery. Connection loss can be simulated; deliveries handed
//! out before the loss can no longer be acked and come back on reconnect.

use super::{
    AckHandle, Broker, BrokerConnector, ConnectionState, Delivery, DurableSubscription,
    PublishOutcome,
};
use crate::error::{Error, Result};
use crate::event_bus::{ConnectionEvent, ConnectionEvents};
use crate::router::SubjectPattern;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(120);
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_MESSAGES: usize = 10_000;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const POLL_SLICE: Duration = Duration::from_millis(25);

type Responder = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// Lock subjects only keep their newest message.
fn keeps_last_only(subject: &str) -> bool {
    subject == "lock" || subject.starts_with("lock.")
}

struct Stored {
    seq: u64,
    subject: String,
    payload: Vec<u8>,
    stored_at: Instant,
}

struct Inflight {
    generation: u64,
    expires_at: Instant,
}

struct ConsumerState {
    filter: SubjectPattern,
    /// Lowest stream sequence this consumer has not looked at yet
    cursor: u64,
    inflight: HashMap<u64, Inflight>,
    /// seq -> earliest redelivery time
    redeliver: BTreeMap<u64, Instant>,
    delivered: HashMap<u64, u32>,
}

struct State {
    connected: bool,
    closed: bool,
    generation: u64,
    next_seq: u64,
    log: VecDeque<Stored>,
    dedup: HashMap<String, Instant>,
    consumers: HashMap<String, ConsumerState>,
    responders: Vec<(SubjectPattern, Responder)>,
}

impl State {
    /// Apply retention limits and forget dedup keys outside the window.
    fn prune(&mut self, now: Instant, dedup_window: Duration, max_messages: usize, max_age: Duration) {
        self.dedup
            .retain(|_, seen_at| now.duration_since(*seen_at) < dedup_window);

        let mut dropped = 0usize;
        while let Some(oldest) = self.log.front() {
            let too_many = self.log.len() > max_messages;
            let too_old = now.duration_since(oldest.stored_at) >= max_age;
            if !too_many && !too_old {
                break;
            }
            self.log.pop_front();
            dropped += 1;
        }

        if dropped > 0 {
            debug!(dropped = dropped, retained = self.log.len(), "Retention limits applied");
            let log = &self.log;
            let retained = |seq: &u64| log.binary_search_by_key(seq, |m| m.seq).is_ok();
            for consumer in self.consumers.values_mut() {
                consumer.delivered.retain(|seq, _| retained(seq));
                consumer.redeliver.retain(|seq, _| retained(seq));
                consumer.inflight.retain(|seq, _| retained(seq));
            }
        }
    }
}

/// Shared in-memory broker. Clones share the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    events: ConnectionEvents,
    dedup_window: Duration,
    ack_wait: Duration,
    max_messages: usize,
    max_age: Duration,
}

impl MemoryBroker {
    /// A connected broker with default windows.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                connected: true,
                closed: false,
                generation: 0,
                next_seq: 1,
                log: VecDeque::new(),
                dedup: HashMap::new(),
                consumers: HashMap::new(),
                responders: Vec::new(),
            })),
            notify: Arc::new(Notify::new()),
            events: ConnectionEvents::default(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            ack_wait: DEFAULT_ACK_WAIT,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_age: DEFAULT_MAX_AGE,
        }
    }

    /// A broker that refuses connections until [`restore_connection`](Self::restore_connection).
    #[must_use]
    pub fn offline() -> Self {
        let broker = Self::new();
        broker.lock_state().connected = false;
        broker
    }

    /// Set the idempotency dedup window.
    #[must_use]
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Set how long a delivery may stay unacked before it is redelivered.
    #[must_use]
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Retention limits: oldest messages are dropped beyond either bound.
    #[must_use]
    pub fn with_retention(mut self, max_messages: usize, max_age: Duration) -> Self {
        self.max_messages = max_messages.max(1);
        self.max_age = max_age;
        self
    }

    /// Report connection transitions on an existing bus.
    #[must_use]
    pub fn with_events(mut self, events: ConnectionEvents) -> Self {
        self.events = events;
        self
    }

    /// The bus connection transitions are published on.
    #[must_use]
    pub fn events(&self) -> ConnectionEvents {
        self.events.clone()
    }

    /// Answer requests on subjects matching `pattern`.
    pub fn reply_with<F>(&self, pattern: &str, responder: F) -> Result<()>
    where
        F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    {
        let pattern = SubjectPattern::parse(pattern)?;
        self.lock_state().responders.push((pattern, Arc::new(responder)));
        Ok(())
    }

    /// Simulate losing the connection. Outstanding deliveries become stale
    /// and are queued for redelivery.
    pub fn drop_connection(&self) {
        {
            let mut state = self.lock_state();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.generation += 1;
            let now = Instant::now();
            for consumer in state.consumers.values_mut() {
                for (seq, _) in consumer.inflight.drain() {
                    consumer.redeliver.insert(seq, now);
                }
            }
        }
        info!("Memory broker connection dropped");
        self.events.publish(ConnectionEvent::Disconnected {
            reason: Some("connection dropped".to_string()),
        });
        self.notify.notify_waiters();
    }

    /// Bring the connection back, also after [`Broker::close`].
    pub fn restore_connection(&self) {
        {
            let mut state = self.lock_state();
            if state.connected {
                return;
            }
            state.connected = true;
            state.closed = false;
        }
        info!("Memory broker connection restored");
        self.events.publish(ConnectionEvent::Connected {
            endpoint: "memory".to_string(),
        });
        self.notify.notify_waiters();
    }

    /// Payloads retained on subjects matching `pattern`, in publish order.
    pub fn published(&self, pattern: &str) -> Result<Vec<Vec<u8>>> {
        let pattern = SubjectPattern::parse(pattern)?;
        Ok(self
            .lock_state()
            .log
            .iter()
            .filter(|m| pattern.matches(&m.subject))
            .map(|m| m.payload.clone())
            .collect())
    }

    /// Messages a durable consumer has not yet acked (in flight or queued).
    #[must_use]
    pub fn unacked(&self, durable_name: &str) -> usize {
        let state = self.lock_state();
        let Some(consumer) = state.consumers.get(durable_name) else {
            return 0;
        };
        let unseen = state
            .log
            .iter()
            .filter(|m| m.seq >= consumer.cursor && consumer.filter.matches(&m.subject))
            .count();
        consumer.inflight.len() + consumer.redeliver.len() + unseen
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test thread panicked mid-update
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_ready(&self, durable_name: &str, max: usize) -> Result<Vec<Delivery>> {
        let mut state = self.lock_state();
        if !state.connected {
            return Err(Error::Connection("memory broker disconnected".to_string()));
        }

        let now = Instant::now();
        let generation = state.generation;
        let ack_wait = self.ack_wait;
        let State {
            log, consumers, ..
        } = &mut *state;
        let consumer = consumers
            .get_mut(durable_name)
            .ok_or_else(|| Error::Subscribe(format!("unknown durable '{}'", durable_name)))?;

        let expired: Vec<u64> = consumer
            .inflight
            .iter()
            .filter(|(_, f)| f.expires_at <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            consumer.inflight.remove(&seq);
            consumer.redeliver.insert(seq, now);
        }

        let mut picked: Vec<u64> = consumer
            .redeliver
            .iter()
            .filter(|(_, ready_at)| **ready_at <= now)
            .map(|(seq, _)| *seq)
            .take(max)
            .collect();
        for seq in &picked {
            consumer.redeliver.remove(seq);
        }

        let start = log.partition_point(|m| m.seq < consumer.cursor);
        for stored in log.iter().skip(start) {
            if picked.len() >= max {
                break;
            }
            consumer.cursor = stored.seq + 1;
            if consumer.filter.matches(&stored.subject) {
                picked.push(stored.seq);
            }
        }

        let mut deliveries = Vec::with_capacity(picked.len());
        for seq in picked {
            let Some(idx) = log.binary_search_by_key(&seq, |m| m.seq).ok() else {
                continue;
            };
            let stored = &log[idx];
            let count = consumer.delivered.entry(seq).or_insert(0);
            *count += 1;
            consumer.inflight.insert(
                seq,
                Inflight {
                    generation,
                    expires_at: now + ack_wait,
                },
            );
            deliveries.push(Delivery::new(
                stored.subject.clone(),
                stored.payload.clone(),
                *count,
                seq,
                Arc::new(MemoryAck {
                    broker: self.clone(),
                    durable_name: durable_name.to_string(),
                    seq,
                    generation,
                }),
            ));
        }

        Ok(deliveries)
    }

    /// Take `seq` out of flight if this delivery may still settle it.
    fn settle(&self, durable_name: &str, seq: u64, generation: u64) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock_state();
        if !state.connected || state.generation != generation {
            return Err(Error::Ack(format!(
                "delivery {} belongs to a previous connection",
                seq
            )));
        }
        let now = Instant::now();
        let consumer = state
            .consumers
            .get_mut(durable_name)
            .ok_or_else(|| Error::Ack(format!("unknown durable '{}'", durable_name)))?;
        match consumer.inflight.remove(&seq) {
            Some(f) if f.generation != generation => {
                consumer.inflight.insert(seq, f);
                Err(Error::Ack(format!("delivery {} was redelivered", seq)))
            }
            Some(f) if f.expires_at <= now => {
                consumer.redeliver.insert(seq, now);
                Err(Error::Ack(format!("delivery {} exceeded its ack wait", seq)))
            }
            Some(_) => Ok(state),
            None => Err(Error::Ack(format!("delivery {} is no longer in flight", seq))),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        idempotency_key: Option<&str>,
    ) -> Result<PublishOutcome> {
        {
            let mut state = self.lock_state();
            if !state.connected {
                return Err(Error::Publish("memory broker disconnected".to_string()));
            }

            let now = Instant::now();
            state.prune(now, self.dedup_window, self.max_messages, self.max_age);
            if let Some(key) = idempotency_key {
                if state.dedup.contains_key(key) {
                    debug!(subject = %subject, key = %key, "Duplicate publish rejected");
                    return Ok(PublishOutcome::Duplicate);
                }
                state.dedup.insert(key.to_string(), now);
            }

            if keeps_last_only(subject) {
                state.log.retain(|m| m.subject != subject);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.log.push_back(Stored {
                seq,
                subject: subject.to_string(),
                payload,
                stored_at: now,
            });
            state.prune(now, self.dedup_window, self.max_messages, self.max_age);
        }

        self.notify.notify_waiters();
        Ok(PublishOutcome::Accepted)
    }

    async fn subscribe_durable(
        &self,
        subject_pattern: &str,
        durable_name: &str,
    ) -> Result<Box<dyn DurableSubscription>> {
        let filter = SubjectPattern::parse(subject_pattern)?;
        let mut state = self.lock_state();
        if !state.connected {
            return Err(Error::Subscribe("memory broker disconnected".to_string()));
        }

        match state.consumers.get(durable_name) {
            Some(existing) if existing.filter != filter => {
                return Err(Error::Subscribe(format!(
                    "durable '{}' already bound to '{}'",
                    durable_name,
                    existing.filter
                )));
            }
            Some(_) => debug!(durable = %durable_name, "Resuming durable consumer"),
            None => {
                state.consumers.insert(
                    durable_name.to_string(),
                    ConsumerState {
                        filter,
                        cursor: 0,
                        inflight: HashMap::new(),
                        redeliver: BTreeMap::new(),
                        delivered: HashMap::new(),
                    },
                );
                debug!(durable = %durable_name, "Created durable consumer");
            }
        }

        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            durable_name: durable_name.to_string(),
        }))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        _timeout: Duration,
    ) -> Result<Vec<u8>> {
        let responder = {
            let state = self.lock_state();
            if !state.connected {
                return Err(Error::Request("memory broker disconnected".to_string()));
            }
            state
                .responders
                .iter()
                .find(|(pattern, _)| pattern.matches(subject))
                .map(|(_, r)| r.clone())
        };

        match responder {
            Some(respond) => Ok(respond(payload)),
            None => Err(Error::Request(format!("no responders on '{}'", subject))),
        }
    }

    async fn last_message(&self, subject: &str) -> Result<Option<Vec<u8>>> {
        let state = self.lock_state();
        if !state.connected {
            return Err(Error::Request("memory broker disconnected".to_string()));
        }
        Ok(state
            .log
            .iter()
            .rev()
            .find(|m| m.subject == subject)
            .map(|m| m.payload.clone()))
    }

    fn connection_state(&self) -> ConnectionState {
        let state = self.lock_state();
        if state.closed {
            ConnectionState::Closed
        } else if state.connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.closed {
                return Ok(());
            }
            state.connected = false;
            state.closed = true;
        }
        self.events.publish(ConnectionEvent::Closed);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Broker>> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(Error::Connection("memory broker offline".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }
}

struct MemorySubscription {
    broker: MemoryBroker,
    durable_name: String,
}

#[async_trait]
impl DurableSubscription for MemorySubscription {
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.broker.notify.notified();
            let batch = self.broker.take_ready(&self.durable_name, max.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let slice = (deadline - now).min(POLL_SLICE);
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }
}

struct MemoryAck {
    broker: MemoryBroker,
    durable_name: String,
    seq: u64,
    generation: u64,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(&self) -> Result<()> {
        let mut state = self
            .broker
            .settle(&self.durable_name, self.seq, self.generation)?;
        if let Some(consumer) = state.consumers.get_mut(&self.durable_name) {
            consumer.delivered.remove(&self.seq);
        }
        Ok(())
    }

    async fn nak(&self, delay: Duration) -> Result<()> {
        {
            let mut state = self
                .broker
                .settle(&self.durable_name, self.seq, self.generation)?;
            if let Some(consumer) = state.consumers.get_mut(&self.durable_name) {
                consumer.redeliver.insert(self.seq, Instant::now() + delay);
            }
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn in_progress(&self) -> Result<()> {
        let mut state = self
            .broker
            .settle(&self.durable_name, self.seq, self.generation)?;
        let expires_at = Instant::now() + self.broker.ack_wait;
        if let Some(consumer) = state.consumers.get_mut(&self.durable_name) {
            consumer.inflight.insert(
                self.seq,
                Inflight {
                    generation: self.generation,
                    expires_at,
                },
            );
        }
        Ok(())
    }
}
