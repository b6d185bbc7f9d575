//! Orgflow Core - Organization Orchestration Engine
//!
//! This crate provides the controller logic that sits between the message bus
//! and the organization's change handlers, including:
//! - Profile: Resolving deployment settings into broker connection plans
//! - Session: Broker sessions (NATS JetStream and in-memory)
//! - Router: Hierarchical subject matching and handler dispatch
//! - Consumer: The durable consumer loop that owns ack/nak decisions
//! - Lock: At-most-one action per (organization, reason) via idempotent publish
//! - Bootstrap: Cold-start / recovery / steady-state staging
//! - Controller: Stage loop that runs the consumer while in steady state
//! - Handlers: Built-in change handlers
//! - Utils: Retry and backoff helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bootstrap;
pub mod consumer;
pub mod controller;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod handlers;
pub mod lock;
pub mod profile;
pub mod queue;
pub mod router;
pub mod session;
pub mod shutdown;
pub mod utils;

pub use bootstrap::{
    BootstrapMachine, BootstrapStage, FileStateBackend, NoPriorState, StateBackend,
};
pub use consumer::{ConsumerConfig, ConsumerLoop, ConsumerStats, DeadLetter, StatsSnapshot};
pub use controller::{Controller, ControllerConfig};
pub use error::{format_error_for_cli, Error, Result, UserFriendlyError};
pub use event::Event;
pub use event_bus::{ConnectionEvent, ConnectionEvents};
pub use handlers::{
    EventHandler, HandlerOutcome, LoggingRegenerator, RegenerationHandler, Regenerator,
    TemplateChangeHandler, WorkflowStatusHandler,
};
pub use lock::{Lock, LockManager, LockOutcome, DEFAULT_LOCK_TTL};
pub use profile::{
    BrokerSettings, ConnectionPlan, ConnectionProfile, Credentials, DeploymentType,
    ReconnectPolicy, TlsPolicy,
};
pub use queue::{WorkerPermit, WorkerPool};
pub use router::{Dispatch, Router, RouterBuilder, SubjectPattern};
pub use session::{
    Broker, BrokerConnector, ConnectionState, Delivery, DurableSubscription, JetStreamSettings,
    MemoryBroker, NatsConnector, NatsSession, PublishOutcome,
};
pub use shutdown::{wait_for_shutdown_signal, ShutdownController, ShutdownPhase};
pub use utils::{retry_with_backoff, RetryConfig};
