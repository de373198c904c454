//! primer-orca - job orchestration for primer-set optimization runs.
//!
//! Each job runs an external optimizer binary that searches for primer sets.
//! Many users share one capacity-limited worker pool, so this crate owns
//! everything between "job submitted" and "result stored":
//!
//! - **Resource ledger**: [`ResourceLedger`] records how many threads each
//!   running attempt holds, in a shared TTL cache ([`SharedCache`]).
//! - **Thread allocator**: [`ThreadAllocator`] sizes an attempt from the free
//!   capacity and the job's run history, backing off after a crash.
//! - **Run ledger**: [`RunLedger`] opens and closes [`Run`]s and materializes
//!   the job's [`JobResult`] from the optimizer outputs.
//! - **Status**: [`resolve_status`] derives a [`JobStatus`] from the result
//!   store, the task queue and the live worker set. Status is never stored.
//! - **Executor**: [`AttemptExecutor::run_attempt`] drives one attempt and can
//!   be re-invoked safely for the same job.
//! - **Sweeps**: [`LeaseSweep`] and [`OrphanSweep`] repair leaked leases and
//!   jobs whose worker died.
//! - **Runtime**: [`OrchestratorRuntime`] runs attempt workers and the sweep
//!   housekeeper in-process.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL job store via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use primer_orca::*;
//! use std::sync::Arc;
//!
//! let config = OrchestratorConfig::load("orca.toml")?;
//! let queue = Arc::new(InMemoryTaskQueue::new());
//! let runtime = OrchestratorRuntimeBuilder::new(config)
//!     .with_store(Arc::new(InMemoryJobStore::new()))
//!     .with_cache(Arc::new(InMemoryCache::new()))
//!     .with_queue(queue)
//!     .build()?;
//!
//! runtime.spawn_worker_pool(4).await;
//! runtime.spawn_housekeeper().await;
//! let job = runtime.executor().submit_job(job).await?;
//! ```

/// Thread allocation against the shared lease ledger.
pub mod budget;

/// Shared TTL key/value cache.
pub mod cache;

/// Orchestrator and persistence configuration.
pub mod config;

/// Attempt-level error taxonomy.
pub mod error;

/// Job lifecycle events and the in-process event bus.
pub mod events;

/// Single job attempts and job submission.
pub mod executor;

/// Jobs, identifiers and derived status.
pub mod job;

/// Per-job thread leases.
pub mod lease;

/// Memoized task liveness lookups.
pub mod liveness;

/// Typed job parameter registry.
pub mod params;

/// The optimizer subprocess.
pub mod process;

/// Task queue contracts and the in-memory queue.
pub mod queue;

/// Optimizer outputs and the structured result matrix.
pub mod result;

/// Runs and the run ledger.
pub mod run;

/// Job status derivation.
pub mod status;

/// Job, run and result persistence.
pub mod store;

/// Reconciliation sweeps.
pub mod sweep;

/// Tracing spans and recording helpers.
pub mod telemetry;

#[cfg(feature = "metrics")]
/// Prometheus collectors.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
pub mod persistence;

/// Worker pool, housekeeper and shutdown.
pub mod runtime;

pub use budget::*;
pub use cache::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use executor::*;
pub use job::*;
pub use lease::*;
pub use liveness::*;
pub use params::*;
pub use process::*;
pub use queue::*;
pub use result::*;
pub use run::*;
pub use runtime::*;
pub use status::*;
pub use store::*;
pub use sweep::*;
