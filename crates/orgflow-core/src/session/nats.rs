//! NATS JetStream session.
//!
//! Connects with a resolved [`ConnectionProfile`], makes sure the event and
//! lock streams exist, and maps JetStream primitives onto the [`Broker`]
//! trait: `Nats-Msg-Id` for idempotent publish, pull consumers for durable
//! subscriptions, explicit ack/nak/progress per message. Lock subjects keep
//! one message each so the newest lock record can be read back.

use super::{
    AckHandle, Broker, BrokerConnector, ConnectionState, Delivery, DurableSubscription,
    PublishOutcome,
};
use crate::error::{Error, Result};
use crate::event_bus::{ConnectionEvent, ConnectionEvents};
use crate::lock::DEFAULT_LOCK_TTL;
use crate::profile::{ConnectionPlan, ConnectionProfile, Credentials};
use async_nats::jetstream::stream::LastRawMessageErrorKind;
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, stream, AckKind};
use async_nats::{header::NATS_MESSAGE_ID, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stream holding change events and dead letters
pub const EVENTS_STREAM: &str = "ORG_EVENTS";
/// Stream holding lock sentinels
pub const LOCKS_STREAM: &str = "ORG_LOCKS";

/// JetStream-side settings that are not part of the connection profile.
#[derive(Debug, Clone)]
pub struct JetStreamSettings {
    /// Lock lifetime; becomes the duplicate window of both streams
    pub lock_ttl: Duration,
    /// How long a delivery may stay unacked before redelivery
    pub ack_wait: Duration,
}

impl Default for JetStreamSettings {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            ack_wait: Duration::from_secs(30),
        }
    }
}

/// Stream a subject is stored in.
fn stream_for(subject: &str) -> &'static str {
    if subject == "lock" || subject.starts_with("lock.") {
        LOCKS_STREAM
    } else {
        EVENTS_STREAM
    }
}

fn events_stream_config(lock_ttl: Duration) -> stream::Config {
    let max_age = Duration::from_secs(24 * 60 * 60);
    stream::Config {
        name: EVENTS_STREAM.to_string(),
        subjects: vec!["change.>".to_string(), "deadletter.>".to_string()],
        duplicate_window: lock_ttl.min(max_age),
        max_age,
        max_messages: 10_000,
        max_bytes: 100 * 1024 * 1024,
        ..Default::default()
    }
}

fn locks_stream_config(lock_ttl: Duration) -> stream::Config {
    // The dedup window may not exceed the retention period
    let max_age = lock_ttl.max(Duration::from_secs(60 * 60));
    stream::Config {
        name: LOCKS_STREAM.to_string(),
        subjects: vec!["lock.>".to_string()],
        duplicate_window: lock_ttl,
        max_age,
        max_messages_per_subject: 1,
        ..Default::default()
    }
}

/// A live JetStream session.
pub struct NatsSession {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    events: ConnectionEvents,
    settings: JetStreamSettings,
    profile: String,
    closed: Arc<AtomicBool>,
}

impl NatsSession {
    /// Connect with one profile and prepare the streams.
    pub async fn connect(
        profile: &ConnectionProfile,
        events: &ConnectionEvents,
        settings: &JetStreamSettings,
    ) -> Result<Self> {
        let closed = Arc::new(AtomicBool::new(false));
        let options = connect_options(profile, events, Arc::clone(&closed)).await?;
        let endpoints = profile.endpoints.join(",");

        info!(
            profile = %profile.name,
            endpoints = %endpoints,
            credentials = profile.credentials.kind(),
            tls = profile.tls.enabled,
            "Connecting to NATS"
        );
        let client = options.connect(profile.endpoints.as_slice()).await?;

        let jetstream = match profile.jetstream_domain.as_deref() {
            Some(domain) => jetstream::with_domain(client.clone(), domain),
            None => jetstream::new(client.clone()),
        };

        let session = Self {
            client,
            jetstream,
            events: events.clone(),
            settings: settings.clone(),
            profile: profile.name.clone(),
            closed,
        };
        session.ensure_streams().await?;

        info!(profile = %session.profile, "NATS session ready");
        Ok(session)
    }

    /// Name of the profile this session connected with.
    #[must_use]
    pub fn profile(&self) -> &str {
        &self.profile
    }

    async fn ensure_streams(&self) -> Result<()> {
        for config in [
            events_stream_config(self.settings.lock_ttl),
            locks_stream_config(self.settings.lock_ttl),
        ] {
            let name = config.name.clone();
            self.jetstream
                .get_or_create_stream(config)
                .await
                .map_err(|e| Error::Subscribe(format!("stream {}: {}", name, e)))?;
            debug!(stream = %name, "Stream ready");
        }
        Ok(())
    }
}

async fn connect_options(
    profile: &ConnectionProfile,
    events: &ConnectionEvents,
    closed: Arc<AtomicBool>,
) -> Result<ConnectOptions> {
    let mut options = ConnectOptions::new();

    options = match &profile.credentials {
        Credentials::None => options,
        Credentials::File(path) => options
            .credentials_file(path)
            .await
            .map_err(|e| Error::config("broker.creds_file", e.to_string()))?,
        Credentials::NkeyFile(path) => {
            let seed = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::config("broker.nkey_file", e.to_string()))?;
            options.nkey(seed.trim().to_string())
        }
        Credentials::JwtSeed { jwt, seed } => {
            let bundle = Credentials::creds_bundle(jwt, seed);
            options
                .credentials(bundle.expose())
                .map_err(|e| Error::config("broker.jwt", e.to_string()))?
        }
    };

    if profile.tls.enabled {
        options = options.require_tls(true);
        if let Some(ca) = &profile.tls.ca_file {
            options = options.add_root_certificates(ca.clone());
        }
        if let Some((cert, key)) = &profile.tls.client_cert {
            options = options.add_client_certificate(cert.clone(), key.clone());
        }
    }

    let backoff = profile.reconnect.backoff.clone();
    let bus = events.clone();
    let endpoint = profile.endpoints.join(",");

    Ok(options
        .name(&profile.client_name)
        .connection_timeout(profile.reconnect.connect_timeout)
        .max_reconnects(profile.reconnect.max_attempts)
        .reconnect_delay_callback(move |attempts| {
            backoff.delay_for_attempt(u32::try_from(attempts).unwrap_or(u32::MAX))
        })
        .event_callback(move |event| {
            let bus = bus.clone();
            let endpoint = endpoint.clone();
            let closed = Arc::clone(&closed);
            async move {
                match event {
                    async_nats::Event::Connected => {
                        info!(endpoint = %endpoint, "NATS connected");
                        bus.publish(ConnectionEvent::Connected { endpoint });
                    }
                    async_nats::Event::Disconnected => {
                        warn!(endpoint = %endpoint, "NATS disconnected, reconnecting");
                        bus.publish(ConnectionEvent::Disconnected { reason: None });
                    }
                    async_nats::Event::Closed => {
                        // close() reports its own shutdown
                        if !closed.swap(true, Ordering::SeqCst) {
                            warn!(endpoint = %endpoint, "NATS connection closed");
                            bus.publish(ConnectionEvent::Closed);
                        }
                    }
                    other => debug!(event = ?other, "NATS client event"),
                }
            }
        }))
}

#[async_trait]
impl Broker for NatsSession {
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        idempotency_key: Option<&str>,
    ) -> Result<PublishOutcome> {
        let pending = match idempotency_key {
            Some(key) => {
                let mut headers = HeaderMap::new();
                headers.insert(NATS_MESSAGE_ID, key);
                self.jetstream
                    .publish_with_headers(subject.to_string(), headers, payload.into())
                    .await
            }
            None => {
                self.jetstream
                    .publish(subject.to_string(), payload.into())
                    .await
            }
        }
        .map_err(|e| Error::Publish(format!("{}: {}", subject, e)))?;

        let ack = pending
            .await
            .map_err(|e| Error::Publish(format!("{}: {}", subject, e)))?;

        if ack.duplicate {
            debug!(subject = %subject, stream = %ack.stream, "Duplicate publish rejected");
            Ok(PublishOutcome::Duplicate)
        } else {
            Ok(PublishOutcome::Accepted)
        }
    }

    async fn subscribe_durable(
        &self,
        subject_pattern: &str,
        durable_name: &str,
    ) -> Result<Box<dyn DurableSubscription>> {
        let stream_name = stream_for(subject_pattern);
        let stream = self
            .jetstream
            .get_stream(stream_name)
            .await
            .map_err(|e| Error::Subscribe(format!("stream {}: {}", stream_name, e)))?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: subject_pattern.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.settings.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Subscribe(format!("consumer {}: {}", durable_name, e)))?;

        info!(
            durable = %durable_name,
            stream = %stream_name,
            filter = %subject_pattern,
            "Durable consumer bound"
        );
        Ok(Box::new(NatsSubscription {
            consumer,
            durable_name: durable_name.to_string(),
        }))
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let reply = tokio::time::timeout(
            timeout,
            self.client.request(subject.to_string(), payload.into()),
        )
        .await
        .map_err(|_| Error::Timeout(format!("request on {}", subject)))??;
        Ok(reply.payload.to_vec())
    }

    async fn last_message(&self, subject: &str) -> Result<Option<Vec<u8>>> {
        let stream_name = stream_for(subject);
        let stream = self
            .jetstream
            .get_stream(stream_name)
            .await
            .map_err(|e| Error::Request(format!("stream {}: {}", stream_name, e)))?;
        match stream.get_last_raw_message_by_subject(subject).await {
            Ok(message) => Ok(Some(message.payload.to_vec())),
            Err(e) if e.kind() == LastRawMessageErrorKind::NoMessageFound => Ok(None),
            Err(e) => Err(Error::Request(format!("last message on {}: {}", subject, e))),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            return ConnectionState::Closed;
        }
        match self.client.connection_state() {
            async_nats::connection::State::Connected => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Flush on close failed");
        }
        if let Err(e) = self.client.drain().await {
            warn!(error = %e, "Drain on close failed");
        }
        self.events.publish(ConnectionEvent::Closed);
        info!(profile = %self.profile, "NATS session closed");
        Ok(())
    }
}

struct NatsSubscription {
    consumer: jetstream::consumer::Consumer<pull::Config>,
    durable_name: String,
}

#[async_trait]
impl DurableSubscription for NatsSubscription {
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max.max(1))
            .expires(wait)
            .messages()
            .await
            .map_err(|e| Error::Subscribe(format!("fetch {}: {}", self.durable_name, e)))?;

        let mut deliveries = Vec::new();
        while let Some(next) = batch.next().await {
            let message = match next {
                Ok(message) => message,
                Err(e) if deliveries.is_empty() => {
                    return Err(Error::Subscribe(format!("fetch {}: {}", self.durable_name, e)))
                }
                Err(e) => {
                    warn!(durable = %self.durable_name, error = %e, "Fetch ended early");
                    break;
                }
            };

            let (delivered, sequence) = message
                .info()
                .map(|info| (info.delivered, info.stream_sequence))
                .unwrap_or((1, 0));
            let delivered = delivered.clamp(1, i64::from(u32::MAX));
            let subject = message.subject.to_string();
            let payload = message.payload.to_vec();
            deliveries.push(Delivery::new(
                subject,
                payload,
                delivered as u32,
                sequence,
                Arc::new(NatsAck { message }),
            ));
        }

        Ok(deliveries)
    }
}

struct NatsAck {
    message: jetstream::Message,
}

#[async_trait]
impl AckHandle for NatsAck {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Duration) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }

    async fn in_progress(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }
}

/// Opens [`NatsSession`]s, trying each profile of the plan in order.
pub struct NatsConnector {
    plan: ConnectionPlan,
    events: ConnectionEvents,
    settings: JetStreamSettings,
}

impl NatsConnector {
    /// Create a connector for `plan`, reporting transitions on `events`.
    pub fn new(plan: ConnectionPlan, events: ConnectionEvents) -> Self {
        Self {
            plan,
            events,
            settings: JetStreamSettings::default(),
        }
    }

    /// Override stream settings.
    #[must_use]
    pub fn with_settings(mut self, settings: JetStreamSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The plan this connector uses.
    #[must_use]
    pub fn plan(&self) -> &ConnectionPlan {
        &self.plan
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>> {
        let mut last_error = None;

        for profile in self.plan.profiles() {
            match NatsSession::connect(profile, &self.events, &self.settings).await {
                Ok(session) => return Ok(Arc::new(session)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(profile = %profile.name, error = %e, "Profile unreachable");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Connection("no connection profiles".to_string())))
    }
}
