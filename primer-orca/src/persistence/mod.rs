/// PostgreSQL persistence for jobs, runs and results.
///
/// This module provides `PostgresJobStore`, a PostgreSQL-backed
/// implementation of the [`JobStore`](crate::store::JobStore) trait.
pub mod postgres;

pub use postgres::{MIGRATION_0001, PostgresJobStore};
