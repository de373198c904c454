use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::SharedCache;
use crate::job::JobId;

/// Cache key prefix for thread leases.
pub const LEASE_KEY_PREFIX: &str = "threads_allocated@job_";

/// Default lease lifetime in seconds (36 hours). Acts as a dead-man's switch,
/// not as an attempt deadline.
pub const DEFAULT_LEASE_TTL_SECS: i64 = 36 * 60 * 60;

/// Threads currently claimed by the running attempt of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ThreadLease {
    /// Job whose attempt holds the threads.
    pub job_id: JobId,
    /// Number of threads claimed.
    pub threads: u32,
}

/// Build the cache key holding a job's lease.
pub fn lease_key(job_id: JobId) -> String {
    format!("{LEASE_KEY_PREFIX}{job_id}")
}

/// Recover the job id from a lease key.
pub fn job_id_from_key(key: &str) -> Option<JobId> {
    key.strip_prefix(LEASE_KEY_PREFIX)?.parse().ok()
}

/// Shared record of how many threads each active job attempt holds.
///
/// Writes are last-writer-wins per job and nothing here is transactional
/// across keys: the allocator's read-sum-then-write can race with another
/// instance. The lease sweep corrects the resulting drift.
#[derive(Clone)]
pub struct ResourceLedger {
    cache: Arc<dyn SharedCache>,
    ttl: Duration,
}

impl std::fmt::Debug for ResourceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLedger")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ResourceLedger {
    /// Create a ledger with the default 36 hour lease lifetime.
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self::with_ttl(cache, Duration::seconds(DEFAULT_LEASE_TTL_SECS))
    }

    pub fn with_ttl(cache: Arc<dyn SharedCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// Lifetime applied by [`ResourceLedger::set`].
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Overwrite the lease for a job.
    pub async fn set(&self, job_id: JobId, threads: u32) -> anyhow::Result<()> {
        self.set_with_ttl(job_id, threads, self.ttl).await
    }

    pub async fn set_with_ttl(
        &self,
        job_id: JobId,
        threads: u32,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        self.cache
            .set(&lease_key(job_id), threads.to_string(), ttl)
            .await
    }

    /// Threads held by a job. Unparseable values count as absent.
    pub async fn get(&self, job_id: JobId) -> anyhow::Result<Option<u32>> {
        Ok(self
            .cache
            .get(&lease_key(job_id))
            .await?
            .and_then(|raw| raw.trim().parse().ok()))
    }

    /// Release a job's lease.
    pub async fn delete(&self, job_id: JobId) -> anyhow::Result<()> {
        self.cache.delete(&lease_key(job_id)).await
    }

    /// Jobs that currently hold a lease.
    pub async fn list_active(&self) -> anyhow::Result<BTreeSet<JobId>> {
        Ok(self
            .cache
            .keys(&format!("{LEASE_KEY_PREFIX}*"))
            .await?
            .iter()
            .filter_map(|key| job_id_from_key(key))
            .collect())
    }

    /// Every live lease with its thread count.
    ///
    /// A key that expires between listing and reading is skipped.
    pub async fn entries(&self) -> anyhow::Result<Vec<ThreadLease>> {
        let mut leases = Vec::new();
        for job_id in self.list_active().await? {
            if let Some(threads) = self.get(job_id).await? {
                leases.push(ThreadLease { job_id, threads });
            }
        }
        Ok(leases)
    }

    /// Sum of every live lease.
    pub async fn total_threads(&self) -> anyhow::Result<u64> {
        Ok(self
            .entries()
            .await?
            .iter()
            .map(|lease| u64::from(lease.threads))
            .sum())
    }
}
