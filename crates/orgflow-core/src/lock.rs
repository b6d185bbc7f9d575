//! Dedup/Lock Manager
//!
//! At most one action per `(organization, reason)` inside the lock TTL. The
//! lock is an idempotent publish: a record goes to `lock.<org>.<reason>` with
//! an idempotency key, and the broker's dedup window answers whether someone
//! already holds it. There is no separate lock service and nothing to clean
//! up when the owner dies; the entry simply ages out.
//!
//! The lock subject keeps only its newest record. Each record carries an
//! epoch: acquiring publishes `held` under the current epoch's key, releasing
//! publishes `released` with the epoch bumped, so the next acquire uses a key
//! the broker has never seen. Dedup keys are never edited, which both the
//! in-memory broker and JetStream can honor.

use crate::error::Result;
use crate::router::subject::lock_subject;
use crate::session::{Broker, PublishOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default lock lifetime
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(120);

/// Record stored on the lock subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum Record {
    Held {
        owner: Uuid,
        acquired_at: DateTime<Utc>,
        ttl_secs: u64,
        epoch: u64,
        /// Fingerprint of the event that took the lock
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger: Option<String>,
    },
    Released {
        epoch: u64,
        released_at: DateTime<Utc>,
    },
}

impl Record {
    fn epoch(&self) -> u64 {
        match self {
            Self::Held { epoch, .. } | Self::Released { epoch, .. } => *epoch,
        }
    }
}

/// A lock this process acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    /// Organization
    pub organization: String,
    /// Reason token
    pub reason: String,
    /// Owner id of the acquiring process
    pub owner: Uuid,
    /// When the lock was taken
    pub acquired_at: DateTime<Utc>,
    /// Lifetime
    pub ttl: Duration,
    /// Generation of the lock subject this hold belongs to
    pub epoch: u64,
}

impl Lock {
    /// Whether the TTL has run out by `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(self.ttl)
            .map(|ttl| now - self.acquired_at >= ttl)
            .unwrap_or(false)
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// We hold the lock
    Acquired(Lock),
    /// Someone else (or an earlier attempt for another trigger) holds it
    Held,
}

impl LockOutcome {
    /// Whether the lock was acquired.
    #[must_use]
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Lock manager bound to one broker session.
#[derive(Clone)]
pub struct LockManager {
    broker: Arc<dyn Broker>,
    ttl: Duration,
    owner: Uuid,
}

impl LockManager {
    /// Lock manager with the default TTL.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_ttl(broker, DEFAULT_LOCK_TTL)
    }

    /// Lock manager with a custom TTL. The broker's dedup window must match.
    pub fn with_ttl(broker: Arc<dyn Broker>, ttl: Duration) -> Self {
        Self {
            broker,
            ttl,
            owner: Uuid::new_v4(),
        }
    }

    /// Configured lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Owner id stamped into lock records from this manager.
    #[must_use]
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Try to take the lock for `(organization, reason)`.
    ///
    /// `Held` is normal control flow. Errors mean the broker could not be
    /// asked, not that the lock is taken.
    pub async fn try_acquire(&self, organization: &str, reason: &str) -> Result<LockOutcome> {
        self.acquire(organization, reason, None).await
    }

    /// Like [`try_acquire`](Self::try_acquire), on behalf of the event
    /// identified by `trigger`. If the current hold was taken for the same
    /// trigger, e.g. by an attempt that timed out before finishing, the hold
    /// is resumed instead of reported as held.
    pub async fn try_acquire_for(
        &self,
        organization: &str,
        reason: &str,
        trigger: &str,
    ) -> Result<LockOutcome> {
        self.acquire(organization, reason, Some(trigger)).await
    }

    async fn acquire(
        &self,
        organization: &str,
        reason: &str,
        trigger: Option<&str>,
    ) -> Result<LockOutcome> {
        let subject = lock_subject(organization, reason)?;
        let epoch = self.current(&subject).await?.map_or(0, |r| r.epoch());
        let key = lock_key(organization, reason, epoch);
        let acquired_at = Utc::now();
        let payload = serde_json::to_vec(&Record::Held {
            owner: self.owner,
            acquired_at,
            ttl_secs: self.ttl.as_secs(),
            epoch,
            trigger: trigger.map(str::to_string),
        })?;

        let lock = Lock {
            organization: organization.to_string(),
            reason: reason.to_string(),
            owner: self.owner,
            acquired_at,
            ttl: self.ttl,
            epoch,
        };

        match self.broker.publish(&subject, payload, Some(&key)).await? {
            PublishOutcome::Accepted => {
                info!(
                    organization = %organization,
                    reason = %reason,
                    epoch = epoch,
                    ttl_secs = self.ttl.as_secs(),
                    "Lock acquired"
                );
                Ok(LockOutcome::Acquired(lock))
            }
            PublishOutcome::Duplicate => {
                let resumed = match (trigger, self.current(&subject).await?) {
                    (
                        Some(wanted),
                        Some(Record::Held {
                            epoch: held_epoch,
                            trigger: Some(held_by),
                            acquired_at,
                            ..
                        }),
                    ) if held_epoch == epoch && held_by == wanted => Some(acquired_at),
                    _ => None,
                };

                match resumed {
                    Some(acquired_at) => {
                        info!(
                            organization = %organization,
                            reason = %reason,
                            epoch = epoch,
                            "Lock resumed for the same trigger"
                        );
                        Ok(LockOutcome::Acquired(Lock { acquired_at, ..lock }))
                    }
                    None => {
                        debug!(organization = %organization, reason = %reason, "Lock already held");
                        Ok(LockOutcome::Held)
                    }
                }
            }
        }
    }

    /// Newest record on the lock subject; unreadable records count as none.
    async fn current(&self, subject: &str) -> Result<Option<Record>> {
        let Some(payload) = self.broker.last_message(subject).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&payload) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(subject = %subject, error = %e, "Ignoring unreadable lock record");
                Ok(None)
            }
        }
    }

    /// Release a lock we acquired.
    pub async fn release(&self, lock: &Lock) {
        self.release_key(&lock.organization, &lock.reason).await;
    }

    /// Release by name, regardless of who acquired it. Used when a completion
    /// event arrives on a different process than the one that took the lock.
    ///
    /// Best effort: failures are logged and the TTL takes over.
    pub async fn release_key(&self, organization: &str, reason: &str) {
        if let Err(e) = self.try_release(organization, reason).await {
            warn!(
                organization = %organization,
                reason = %reason,
                error = %e,
                "Lock release failed, will expire after TTL"
            );
        }
    }

    async fn try_release(&self, organization: &str, reason: &str) -> Result<()> {
        let subject = lock_subject(organization, reason)?;
        let epoch = match self.current(&subject).await? {
            Some(Record::Held { epoch, .. }) => epoch,
            _ => {
                debug!(organization = %organization, reason = %reason, "Lock not held, nothing to release");
                return Ok(());
            }
        };

        let payload = serde_json::to_vec(&Record::Released {
            epoch: epoch + 1,
            released_at: Utc::now(),
        })?;
        let key = format!("release:{organization}:{reason}:{epoch}");
        self.broker.publish(&subject, payload, Some(&key)).await?;
        info!(organization = %organization, reason = %reason, epoch = epoch, "Lock released");
        Ok(())
    }
}

/// Idempotency key for a lock hold in `epoch`.
#[must_use]
pub fn lock_key(organization: &str, reason: &str, epoch: u64) -> String {
    format!("lock:{organization}:{reason}:{epoch}")
}
