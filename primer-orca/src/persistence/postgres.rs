use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::job::{Job, JobId, PrimerPairsRef, RunId, SequenceSetRef, TaskHandle};
use crate::result::JobResult;
use crate::run::Run;
use crate::store::JobStore;

/// Schema for the tables used by [`PostgresJobStore`].
pub const MIGRATION_0001: &str = include_str!("../../migrations/0001_init.sql");

const JOB_COLUMNS: &str = "id, owner, is_public, parameters, task_handle, sequence_set_id, \
     sequence_set_path, primer_pairs_id, primer_pairs_content, created_at";

/// PostgreSQL-backed job store.
///
/// Jobs, runs and results live in `primer_jobs`, `primer_runs` and
/// `primer_results`. The primary key on `primer_results.job_id` enforces
/// the one-result-per-job rule.
#[derive(Clone, Debug)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool using `config`.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(
                config.acquire_timeout_seconds,
            ))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables if they do not exist.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(MIGRATION_0001).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_job(row: &PgRow) -> anyhow::Result<Job> {
        let parameters: serde_json::Value = row.try_get("parameters")?;
        let task_handle: Option<Uuid> = row.try_get("task_handle")?;
        let sequence_set_path: String = row.try_get("sequence_set_path")?;
        Ok(Job {
            id: JobId(row.try_get("id")?),
            owner: row.try_get("owner")?,
            is_public: row.try_get("is_public")?,
            parameters: serde_json::from_value(parameters)?,
            task_handle: task_handle.map(TaskHandle),
            sequence_set: SequenceSetRef {
                id: row.try_get("sequence_set_id")?,
                path: sequence_set_path.into(),
            },
            primer_pairs: PrimerPairsRef {
                id: row.try_get("primer_pairs_id")?,
                content: row.try_get("primer_pairs_content")?,
            },
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_run(row: &PgRow) -> anyhow::Result<Run> {
        let log: serde_json::Value = row.try_get("log")?;
        let log = match log {
            serde_json::Value::Object(map) => map,
            other => anyhow::bail!("run log is not an object: {other}"),
        };
        let finished_at: Option<DateTime<Utc>> = row.try_get("finished_at")?;
        Ok(Run {
            id: RunId(row.try_get("id")?),
            job_id: JobId(row.try_get("job_id")?),
            log,
            started_at: row.try_get("started_at")?,
            finished_at,
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO primer_jobs (
                id, owner, is_public, parameters, task_handle, sequence_set_id,
                sequence_set_path, primer_pairs_id, primer_pairs_content, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.owner)
        .bind(job.is_public)
        .bind(serde_json::to_value(&job.parameters)?)
        .bind(job.task_handle.map(|h| h.0))
        .bind(job.sequence_set.id)
        .bind(job.sequence_set.path.display().to_string())
        .bind(job.primer_pairs.id)
        .bind(&job.primer_pairs.content)
        .bind(job.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some("23505") =>
            {
                Err(anyhow::anyhow!("job {} already exists", job.id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn load_job(&self, job_id: JobId) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM primer_jobs WHERE id = $1"
        ))
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn update_task_handle(
        &self,
        job_id: JobId,
        handle: Option<TaskHandle>,
    ) -> anyhow::Result<()> {
        let updated = sqlx::query("UPDATE primer_jobs SET task_handle = $1 WHERE id = $2")
            .bind(handle.map(|h| h.0))
            .bind(job_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            anyhow::bail!("job {job_id} not found");
        }
        Ok(())
    }

    async fn insert_run(&self, run: &Run) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO primer_runs (id, job_id, log, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run.id.0)
        .bind(run.job_id.0)
        .bind(serde_json::Value::Object(run.log.clone()))
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_run(&self, run: &Run) -> anyhow::Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE primer_runs
            SET log = $1,
                finished_at = $2
            WHERE id = $3
            "#,
        )
        .bind(serde_json::Value::Object(run.log.clone()))
        .bind(run.finished_at)
        .bind(run.id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            anyhow::bail!("run {} not found", run.id);
        }
        Ok(())
    }

    async fn list_runs(&self, job_id: JobId) -> anyhow::Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, log, started_at, finished_at
            FROM primer_runs
            WHERE job_id = $1
            ORDER BY started_at ASC, id ASC
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_run).collect()
    }

    async fn count_runs(&self, job_id: JobId) -> anyhow::Result<usize> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM primer_runs WHERE job_id = $1")
            .bind(job_id.0)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        Ok(usize::try_from(count)?)
    }

    async fn has_result(&self, job_id: JobId) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 AS found FROM primer_results WHERE job_id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_result(&self, result: &JobResult) -> anyhow::Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO primer_results (
                job_id, init_primers, init_scores, out_primers, out_scores, data, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(result.job_id.0)
        .bind(&result.init_primers)
        .bind(&result.init_scores)
        .bind(&result.out_primers)
        .bind(&result.out_scores)
        .bind(serde_json::to_value(&result.data)?)
        .bind(result.completed_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                debug!(job_id = %result.job_id, "result stored");
                Ok(())
            }
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some("23505") =>
            {
                Err(anyhow::anyhow!("job {} already has a result", result.job_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn load_result(&self, job_id: JobId) -> anyhow::Result<Option<JobResult>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, init_primers, init_scores, out_primers, out_scores, data, completed_at
            FROM primer_results
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data: serde_json::Value = row.try_get("data")?;
        Ok(Some(JobResult {
            job_id: JobId(row.try_get("job_id")?),
            init_primers: row.try_get("init_primers")?,
            init_scores: row.try_get("init_scores")?,
            out_primers: row.try_get("out_primers")?,
            out_scores: row.try_get("out_scores")?,
            data: serde_json::from_value(data)?,
            completed_at: row.try_get("completed_at")?,
        }))
    }

    async fn orphan_candidates(&self) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM primer_jobs j
            WHERE NOT EXISTS (SELECT 1 FROM primer_results r WHERE r.job_id = j.id)
              AND (
                NOT EXISTS (SELECT 1 FROM primer_runs r WHERE r.job_id = j.id)
                OR EXISTS (
                    SELECT 1 FROM primer_runs r
                    WHERE r.job_id = j.id AND r.finished_at IS NULL
                )
              )
            ORDER BY j.created_at ASC, j.id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }
}
