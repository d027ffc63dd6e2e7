#[macro_use]
extern crate tracing;

mod schema;

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use job_queue::{JobCtx, JobQueue, JobReader, RetryPolicy, RunnerWaker, ScheduleFor};
use libsql::Connection;
use time::OffsetDateTime;
use ulid::Ulid;
use uuid::Uuid;

#[rustfmt::skip]
pub use libsql;

/// [`JobQueue`] stored in a single libSQL table.
///
/// Rows are claimed by flipping their state to running inside one `UPDATE … RETURNING`
/// statement. SQLite serializes writers, so two runners never claim the same row.
/// Each row keeps the retry policy it was pushed with.
#[derive(typed_builder::TypedBuilder)]
pub struct LibSqlJobQueue {
    runner_waker: RunnerWaker,
    conn: Connection,
}

const STATE_QUEUED: i64 = 0;
const STATE_RUNNING: i64 = 1;

const INSERT_JOB: &str = "
    INSERT INTO job_queue (id, scheduled_for, failed_attempts, max_attempts, backoff_ms, status, name, def)
    VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, jsonb(?7))";

const CLAIM_DUE_JOBS: &str = "
    UPDATE job_queue SET status = ?1
    WHERE id IN (
        SELECT id FROM job_queue
        WHERE status = ?2 AND failed_attempts < max_attempts AND scheduled_for <= unixepoch()
        ORDER BY id
        LIMIT ?3
    )
    RETURNING id, failed_attempts, max_attempts, backoff_ms, name, json(def) AS def";

const REQUEUE_FAILED_JOB: &str = "
    UPDATE job_queue
    SET status = ?1, failed_attempts = failed_attempts + 1, scheduled_for = ?2
    WHERE id = ?3";

const EARLIEST_PENDING: &str = "
    SELECT MIN(scheduled_for) FROM job_queue
    WHERE status = ?1 AND failed_attempts < max_attempts";

#[derive(serde::Deserialize, Debug)]
struct ClaimedRow {
    id: Uuid,
    failed_attempts: u32,
    max_attempts: u32,
    backoff_ms: u64,
    name: String,
    def: String,
}

impl ClaimedRow {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

impl LibSqlJobQueue {
    async fn execute(&self, sql_query: &str, params: impl libsql::params::IntoParams) -> anyhow::Result<u64> {
        self.conn
            .execute(sql_query, params)
            .await
            .with_context(|| format!("failed to execute {}", sql_query.trim()))
    }

    /// Turns a claimed row into a runnable job, or drops the row if its definition is unreadable.
    async fn decode_claimed(&self, row: ClaimedRow, reader: &dyn JobReader) -> Option<JobCtx> {
        match reader.read_json(&row.name, &row.def) {
            Ok(job) => Some(JobCtx {
                id: row.id,
                failed_attempts: row.failed_attempts,
                retry_policy: row.retry_policy(),
                job,
            }),
            Err(error) => {
                error!(
                    error = format!("{error:#}"),
                    job_id = %row.id,
                    job_name = %row.name,
                    "Unreadable job definition, dropping the job"
                );

                if let Err(error) = self.delete_job(row.id).await {
                    warn!(error = format!("{error:#}"), job_id = %row.id, "Failed to drop unreadable job");
                }

                None
            }
        }
    }
}

#[async_trait]
impl JobQueue for LibSqlJobQueue {
    async fn setup(&self) -> anyhow::Result<()> {
        schema::tune(&self.conn).await?;
        schema::upgrade(&self.conn).await
    }

    async fn reset_claimed_jobs(&self) -> anyhow::Result<()> {
        let reset = self
            .execute(
                "UPDATE job_queue SET status = ?1 WHERE status = ?2",
                libsql::params![STATE_QUEUED, STATE_RUNNING],
            )
            .await?;

        if reset > 0 {
            info!(reset, "Re-queued jobs interrupted by the previous shutdown");
        }

        Ok(())
    }

    async fn push_job_raw(
        &self,
        job_name: &str,
        job_def: String,
        retry_policy: RetryPolicy,
        schedule_for: ScheduleFor,
    ) -> anyhow::Result<()> {
        // ULIDs sort by creation time, which keeps the primary key index compact and gives FIFO claims.
        let id = Uuid::from(Ulid::new());

        let due = match schedule_for {
            ScheduleFor::Now => OffsetDateTime::now_utc(),
            ScheduleFor::Once(date) => date,
        };

        let backoff_ms = i64::try_from(retry_policy.backoff.as_millis()).context("backoff out of range")?;

        trace!(%id, job_name, %due, "Pushing job");

        self.execute(
            INSERT_JOB,
            libsql::params![
                id.to_string(),
                due.unix_timestamp(),
                retry_policy.max_attempts,
                backoff_ms,
                STATE_QUEUED,
                job_name,
                job_def,
            ],
        )
        .await?;

        self.runner_waker.wake();

        Ok(())
    }

    async fn claim_jobs(&self, reader: &dyn JobReader, number_of_jobs: usize) -> anyhow::Result<Vec<JobCtx>> {
        let limit = i64::try_from(number_of_jobs).context("number_of_jobs out of range")?;

        let mut rows = self
            .conn
            .query(CLAIM_DUE_JOBS, libsql::params![STATE_RUNNING, STATE_QUEUED, limit])
            .await
            .context("failed to claim jobs")?;

        let mut claimed = Vec::new();

        while let Some(row) = rows.next().await.context("failed to read claimed row")? {
            match libsql::de::from_row::<'_, ClaimedRow>(&row) {
                Ok(row) => claimed.push(row),
                Err(error) => error!(%error, ?row, "Malformed job row"),
            }
        }

        let mut jobs = Vec::with_capacity(claimed.len());

        for row in claimed {
            if let Some(job) = self.decode_claimed(row, reader).await {
                jobs.push(job);
            }
        }

        Ok(jobs)
    }

    async fn delete_job(&self, id: Uuid) -> anyhow::Result<()> {
        trace!(%id, "Deleting job");
        self.execute("DELETE FROM job_queue WHERE id = ?1", [id.to_string()])
            .await?;
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, schedule_for: OffsetDateTime) -> anyhow::Result<()> {
        trace!(%id, %schedule_for, "Re-queueing failed job");
        self.execute(
            REQUEUE_FAILED_JOB,
            libsql::params![STATE_QUEUED, schedule_for.unix_timestamp(), id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn clear_failed(&self) -> anyhow::Result<()> {
        let cleared = self
            .execute("DELETE FROM job_queue WHERE failed_attempts >= max_attempts", ())
            .await?;

        if cleared > 0 {
            debug!(cleared, "Dropped jobs out of attempts");
        }

        Ok(())
    }

    async fn next_scheduled_date(&self) -> anyhow::Result<Option<OffsetDateTime>> {
        let mut rows = self
            .conn
            .query(EARLIEST_PENDING, [STATE_QUEUED])
            .await
            .context("failed to query the earliest pending job")?;

        let Some(row) = rows.next().await.context("failed to read the earliest pending job")? else {
            return Ok(None);
        };

        // MIN() over an empty set yields a single NULL.
        let Some(timestamp) = row.get::<Option<i64>>(0).context("scheduled_for is not an integer")? else {
            return Ok(None);
        };

        OffsetDateTime::from_unix_timestamp(timestamp)
            .map(Some)
            .context("scheduled_for is not a valid timestamp")
    }
}
