//! Durable delivery queue with leased, at-least-once claims.
//!
//! One job is stored per attempt. A claim hands the job to exactly one worker
//! together with a fresh lease token; only the holder of the current token
//! may extend or acknowledge it. A lease that runs out without an ack makes
//! the job claimable again, so a crashed worker delays a delivery but never
//! drops it.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{DeliveryJob, JobId},
    storage::Storage,
    Clock,
};
use uuid::Uuid;

/// A job held under a lease.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    /// Queue entry identifier.
    pub id: JobId,
    /// Attempt snapshot.
    pub job: DeliveryJob,
    /// Token proving ownership of the lease.
    pub lease_token: Uuid,
    /// When the lease runs out.
    pub leased_until: DateTime<Utc>,
    /// Times the entry has been claimed, including this claim.
    pub claim_count: u32,
}

/// Queue operations used by the service and the workers.
pub trait DeliveryQueue: Send + Sync + 'static {
    /// Stores a job that becomes claimable after `delay`.
    fn enqueue(
        &self,
        job: DeliveryJob,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>>;

    /// Claims the oldest visible job for `worker` for `lease`.
    fn claim(
        &self,
        worker: &str,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ClaimedJob>>> + Send + '_>>;

    /// Moves the lease expiry to `lease` from now. Returns false if the lease
    /// was lost.
    fn extend_lease(
        &self,
        claim: &ClaimedJob,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Removes the job. Returns false if the lease was lost.
    fn ack(&self, claim: &ClaimedJob) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Clears expired leases and returns how many there were.
    fn release_stalled(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Jobs stored, claimed or not.
    fn depth(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay).map_or(DateTime::<Utc>::MAX_UTC, |d| now + d)
}

/// Queue backed by the `delivery_jobs` table.
pub struct PostgresDeliveryQueue {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresDeliveryQueue {
    /// Creates a queue over the given storage.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl DeliveryQueue for PostgresDeliveryQueue {
    fn enqueue(
        &self,
        job: DeliveryJob,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>> {
        let run_at = after(self.clock.now_utc(), delay);
        Box::pin(async move { self.storage.delivery_jobs.enqueue(&job, run_at).await })
    }

    fn claim(
        &self,
        worker: &str,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ClaimedJob>>> + Send + '_>> {
        let worker = worker.to_string();
        let now = self.clock.now_utc();
        Box::pin(async move {
            let row = self.storage.delivery_jobs.claim(&worker, now, after(now, lease)).await?;
            Ok(row.map(|row| ClaimedJob {
                id: row.id,
                job: row.job.0,
                lease_token: row.lease_token,
                leased_until: row.locked_until,
                claim_count: u32::try_from(row.claim_count).unwrap_or(0),
            }))
        })
    }

    fn extend_lease(
        &self,
        claim: &ClaimedJob,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let (id, token) = (claim.id, claim.lease_token);
        let until = after(self.clock.now_utc(), lease);
        Box::pin(async move { self.storage.delivery_jobs.extend_lease(id, token, until).await })
    }

    fn ack(&self, claim: &ClaimedJob) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let (id, token) = (claim.id, claim.lease_token);
        Box::pin(async move { self.storage.delivery_jobs.ack(id, token).await })
    }

    fn release_stalled(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let now = self.clock.now_utc();
        Box::pin(async move { self.storage.delivery_jobs.release_expired(now).await })
    }

    fn depth(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(async move { self.storage.delivery_jobs.depth().await })
    }
}

pub mod mock {
    //! In-memory queue with the same lease semantics, driven by the injected
    //! clock.

    use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        models::{DeliveryId, DeliveryJob, JobId},
        Clock,
    };
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use super::{after, ClaimedJob, DeliveryQueue};

    #[derive(Debug, Clone)]
    struct Lease {
        token: Uuid,
        until: DateTime<Utc>,
    }

    #[derive(Debug, Clone)]
    struct Entry {
        id: JobId,
        job: DeliveryJob,
        run_at: DateTime<Utc>,
        seq: u64,
        lease: Option<Lease>,
        claim_count: u32,
    }

    impl Entry {
        fn visible(&self, now: DateTime<Utc>) -> bool {
            self.run_at <= now && self.lease.as_ref().is_none_or(|lease| lease.until <= now)
        }
    }

    #[derive(Default)]
    struct State {
        entries: Vec<Entry>,
        next_seq: u64,
        enqueue_error: Option<String>,
    }

    /// Snapshot of a queued job for assertions.
    #[derive(Debug, Clone, PartialEq)]
    pub struct QueuedJob {
        /// Queue entry identifier.
        pub id: JobId,
        /// Attempt snapshot.
        pub job: DeliveryJob,
        /// When the job becomes claimable.
        pub run_at: DateTime<Utc>,
        /// Whether a live or expired lease is recorded.
        pub leased: bool,
    }

    /// Queue held in process memory.
    pub struct InMemoryDeliveryQueue {
        state: Arc<RwLock<State>>,
        clock: Arc<dyn Clock>,
    }

    impl InMemoryDeliveryQueue {
        /// Creates an empty queue.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self { state: Arc::new(RwLock::new(State::default())), clock }
        }

        /// Makes the next enqueue fail with a database error.
        pub async fn inject_enqueue_error(&self, message: impl Into<String>) {
            self.state.write().await.enqueue_error = Some(message.into());
        }

        /// All stored jobs in claim order.
        pub async fn jobs(&self) -> Vec<QueuedJob> {
            let state = self.state.read().await;
            let mut entries = state.entries.clone();
            entries.sort_by_key(|e| (e.run_at, e.seq));
            entries
                .into_iter()
                .map(|e| QueuedJob {
                    id: e.id,
                    job: e.job,
                    run_at: e.run_at,
                    leased: e.lease.is_some(),
                })
                .collect()
        }

        /// Stored jobs belonging to one delivery.
        pub async fn jobs_for(&self, delivery_id: DeliveryId) -> Vec<QueuedJob> {
            self.jobs().await.into_iter().filter(|j| j.job.delivery_id == delivery_id).collect()
        }
    }

    impl DeliveryQueue for InMemoryDeliveryQueue {
        fn enqueue(
            &self,
            job: DeliveryJob,
            delay: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>> {
            let run_at = after(self.clock.now_utc(), delay);
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(message) = state.enqueue_error.take() {
                    return Err(CoreError::Database(message));
                }
                let id = JobId::new();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.entries.push(Entry { id, job, run_at, seq, lease: None, claim_count: 0 });
                Ok(id)
            })
        }

        fn claim(
            &self,
            _worker: &str,
            lease: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Option<ClaimedJob>>> + Send + '_>> {
            let now = self.clock.now_utc();
            Box::pin(async move {
                let mut state = self.state.write().await;
                let Some(entry) = state
                    .entries
                    .iter_mut()
                    .filter(|e| e.visible(now))
                    .min_by_key(|e| (e.run_at, e.seq))
                else {
                    return Ok(None);
                };

                let until = after(now, lease);
                let token = Uuid::new_v4();
                entry.lease = Some(Lease { token, until });
                entry.claim_count += 1;

                Ok(Some(ClaimedJob {
                    id: entry.id,
                    job: entry.job.clone(),
                    lease_token: token,
                    leased_until: until,
                    claim_count: entry.claim_count,
                }))
            })
        }

        fn extend_lease(
            &self,
            claim: &ClaimedJob,
            lease: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            let (id, token) = (claim.id, claim.lease_token);
            let until = after(self.clock.now_utc(), lease);
            Box::pin(async move {
                let mut state = self.state.write().await;
                let Some(held) = state
                    .entries
                    .iter_mut()
                    .find(|e| e.id == id)
                    .and_then(|e| e.lease.as_mut())
                    .filter(|l| l.token == token)
                else {
                    return Ok(false);
                };
                held.until = until;
                Ok(true)
            })
        }

        fn ack(
            &self,
            claim: &ClaimedJob,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            let (id, token) = (claim.id, claim.lease_token);
            Box::pin(async move {
                let mut state = self.state.write().await;
                let before = state.entries.len();
                state.entries.retain(|e| {
                    !(e.id == id && e.lease.as_ref().is_some_and(|l| l.token == token))
                });
                Ok(state.entries.len() < before)
            })
        }

        fn release_stalled(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            let now = self.clock.now_utc();
            Box::pin(async move {
                let mut state = self.state.write().await;
                let mut released = 0;
                for entry in &mut state.entries {
                    if entry.lease.as_ref().is_some_and(|l| l.until <= now) {
                        entry.lease = None;
                        released += 1;
                    }
                }
                Ok(released)
            })
        }

        fn depth(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            Box::pin(async move { Ok(self.state.read().await.entries.len() as u64) })
        }
    }
}
