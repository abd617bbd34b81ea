// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transactional reads and writes of the job table.
//!
//! The job table is the only shared mutable resource the engine owns. All
//! mutations run inside a transaction so that a crash mid-dispatch never
//! loses or duplicates a job. Completed jobs are deleted; permanently failed
//! jobs leave a `failed` tombstone so that later enqueues naming them as a
//! dependency can fail fast.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteExecutor, SqliteTransaction, query, query_scalar};
use tracing::debug;
use uuid::Uuid;

use crate::identifiers::JobId;

use super::job::{JobRecord, JobState, NewJob};

#[derive(FromRow)]
struct SqlJobRecord {
    id: JobId,
    factory_key: String,
    queue_key: Option<String>,
    payload: Vec<u8>,
    sequence: i64,
    created_at: DateTime<Utc>,
    lifespan_ms: Option<i64>,
    max_attempts: Option<i64>,
    current_attempt: i64,
    next_attempt_at: DateTime<Utc>,
    schema_version: i64,
    constraint_keys: String,
    state: String,
    blocked: bool,
    dependency_failed: bool,
}

impl TryFrom<SqlJobRecord> for JobRecord {
    type Error = sqlx::Error;

    fn try_from(record: SqlJobRecord) -> Result<Self, Self::Error> {
        let constraint_keys = serde_json::from_str(&record.constraint_keys)
            .map_err(|error| sqlx::Error::Decode(error.into()))?;
        let state = match record.state.as_str() {
            "pending" => JobState::Pending,
            "failed" => JobState::Failed,
            other => {
                return Err(sqlx::Error::Decode(
                    format!("unknown job state: {other}").into(),
                ));
            }
        };
        Ok(Self {
            id: record.id,
            factory_key: record.factory_key,
            queue_key: record.queue_key,
            payload: record.payload,
            sequence: record.sequence,
            created_at: record.created_at,
            lifespan_ms: record.lifespan_ms,
            max_attempts: record.max_attempts,
            current_attempt: record.current_attempt,
            next_attempt_at: record.next_attempt_at,
            schema_version: record.schema_version,
            constraint_keys,
            state,
            blocked: record.blocked,
            dependency_failed: record.dependency_failed,
        })
    }
}

const SELECT_COLUMNS: &str = "
    j.id, j.factory_key, j.queue_key, j.payload, j.sequence, j.created_at,
    j.lifespan_ms, j.max_attempts, j.current_attempt, j.next_attempt_at,
    j.schema_version, j.constraint_keys, j.state,
    EXISTS(
        SELECT 1 FROM job_dependency d
        JOIN job_queue dep ON dep.id = d.depends_on_id
        WHERE d.job_id = j.id AND dep.state = 'pending'
    ) AS blocked,
    EXISTS(
        SELECT 1 FROM job_dependency d
        JOIN job_queue dep ON dep.id = d.depends_on_id
        WHERE d.job_id = j.id AND dep.state = 'failed'
    ) AS dependency_failed";

impl JobRecord {
    /// Persists a new job and its dependency edges.
    ///
    /// Returns `true` if the record was inserted as failed right away because
    /// one of its dependencies is already a failed tombstone.
    pub(crate) async fn insert(
        txn: &mut SqliteTransaction<'_>,
        job: &NewJob,
        now: DateTime<Utc>,
        schema_version: i64,
    ) -> sqlx::Result<bool> {
        let mut failed_fast = false;
        for dependency in &job.depends_on {
            let failed: bool = query_scalar(
                "SELECT EXISTS(SELECT 1 FROM job_queue WHERE id = ? AND state = 'failed')",
            )
            .bind(dependency)
            .fetch_one(txn.as_mut())
            .await?;
            if failed {
                failed_fast = true;
                break;
            }
        }

        let sequence: i64 = query_scalar(
            "UPDATE scheduler_state SET last_sequence = last_sequence + 1
            WHERE id = 1
            RETURNING last_sequence",
        )
        .fetch_one(txn.as_mut())
        .await?;

        let constraint_keys =
            serde_json::to_string(&job.constraint_keys).expect("infallible serialization");
        let state = if failed_fast { "failed" } else { "pending" };
        let lifespan_ms = job.lifespan.map(|lifespan| lifespan.as_millis() as i64);
        let max_attempts = job.max_attempts.map(i64::from);

        query(
            "INSERT INTO job_queue (
                id, factory_key, queue_key, payload, sequence, state, created_at,
                lifespan_ms, max_attempts, current_attempt, next_attempt_at,
                schema_version, constraint_keys
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(job.id)
        .bind(job.factory_key)
        .bind(&job.queue_key)
        .bind(&job.payload)
        .bind(sequence)
        .bind(state)
        .bind(now)
        .bind(lifespan_ms)
        .bind(max_attempts)
        .bind(now)
        .bind(schema_version)
        .bind(constraint_keys)
        .execute(txn.as_mut())
        .await?;

        for dependency in &job.depends_on {
            query(
                "INSERT INTO job_dependency (job_id, depends_on_id)
                VALUES (?, ?)
                ON CONFLICT DO NOTHING",
            )
            .bind(job.id)
            .bind(dependency)
            .execute(txn.as_mut())
            .await?;
        }

        debug!(id = %job.id, factory_key = job.factory_key, failed_fast, "persisted job record");
        Ok(failed_fast)
    }

    pub(crate) async fn load(
        executor: impl SqliteExecutor<'_>,
        id: JobId,
    ) -> sqlx::Result<Option<JobRecord>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM job_queue j WHERE j.id = ?");
        let record: Option<SqlJobRecord> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await?;
        record.map(JobRecord::try_from).transpose()
    }

    /// All pending records in submission order, with dependency flags.
    pub(crate) async fn load_pending(
        executor: impl SqliteExecutor<'_>,
    ) -> sqlx::Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM job_queue j
            WHERE j.state = 'pending'
            ORDER BY j.sequence ASC"
        );
        let records: Vec<SqlJobRecord> = sqlx::query_as(&sql).fetch_all(executor).await?;
        records.into_iter().map(JobRecord::try_from).collect()
    }

    /// Claims the record for dispatch.
    ///
    /// The claim is the atomic handover point between dispatch and
    /// cancellation: a record cancelled since selection is gone and the claim
    /// misses; a claimed record is running and `cancel_queue` skips it.
    pub(crate) async fn claim(
        executor: impl SqliteExecutor<'_>,
        id: JobId,
        claim: Uuid,
    ) -> sqlx::Result<bool> {
        let result = query(
            "UPDATE job_queue SET locked_by = ?
            WHERE id = ? AND state = 'pending' AND locked_by IS NULL",
        )
        .bind(claim)
        .bind(id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Releases all dispatch claims.
    ///
    /// Called at the start of a pass, when no job is in flight; claims left
    /// behind by an interrupted process would otherwise pin their records.
    pub(crate) async fn release_claims(executor: impl SqliteExecutor<'_>) -> sqlx::Result<()> {
        query("UPDATE job_queue SET locked_by = NULL WHERE locked_by IS NOT NULL")
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Removes the record after terminal success.
    pub(crate) async fn delete(executor: impl SqliteExecutor<'_>, id: JobId) -> sqlx::Result<()> {
        query("DELETE FROM job_queue WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Turns the record into a failed tombstone.
    pub(crate) async fn mark_failed(
        executor: impl SqliteExecutor<'_>,
        id: JobId,
    ) -> sqlx::Result<()> {
        query("UPDATE job_queue SET state = 'failed', locked_by = NULL WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Records a completed attempt and the time of the next one.
    pub(crate) async fn record_attempt(
        executor: impl SqliteExecutor<'_>,
        id: JobId,
        current_attempt: i64,
        next_attempt_at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        query(
            "UPDATE job_queue
            SET current_attempt = ?, next_attempt_at = ?, locked_by = NULL
            WHERE id = ?",
        )
        .bind(current_attempt)
        .bind(next_attempt_at)
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Pushes the next attempt out without counting an attempt (rate limits).
    pub(crate) async fn reschedule(
        executor: impl SqliteExecutor<'_>,
        id: JobId,
        next_attempt_at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        query("UPDATE job_queue SET next_attempt_at = ?, locked_by = NULL WHERE id = ?")
            .bind(next_attempt_at)
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Persists a migrated payload.
    pub(crate) async fn update_payload(
        executor: impl SqliteExecutor<'_>,
        id: JobId,
        payload: &[u8],
        schema_version: i64,
    ) -> sqlx::Result<()> {
        query("UPDATE job_queue SET payload = ?, schema_version = ? WHERE id = ?")
            .bind(payload)
            .bind(schema_version)
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Ids of pending jobs directly depending on `id`.
    pub(crate) async fn pending_dependents(
        executor: impl SqliteExecutor<'_>,
        id: JobId,
    ) -> sqlx::Result<Vec<JobId>> {
        query_scalar(
            "SELECT d.job_id FROM job_dependency d
            JOIN job_queue j ON j.id = d.job_id
            WHERE d.depends_on_id = ? AND j.state = 'pending'",
        )
        .bind(id)
        .fetch_all(executor)
        .await
    }

    /// Pending, unclaimed ids sharing a queue key, in submission order.
    ///
    /// Claimed records are running and excluded, so cancellation never pulls
    /// a record out from under an in-flight job.
    pub(crate) async fn cancellable_in_queue(
        executor: impl SqliteExecutor<'_>,
        queue_key: &str,
    ) -> sqlx::Result<Vec<JobId>> {
        query_scalar(
            "SELECT id FROM job_queue
            WHERE queue_key = ? AND state = 'pending' AND locked_by IS NULL
            ORDER BY sequence ASC",
        )
        .bind(queue_key)
        .fetch_all(executor)
        .await
    }

    /// Declared dependency ids of a job, in stored order.
    pub(crate) async fn load_dependencies(
        executor: impl SqliteExecutor<'_>,
        id: JobId,
    ) -> sqlx::Result<Vec<JobId>> {
        query_scalar(
            "SELECT depends_on_id FROM job_dependency
            WHERE job_id = ?
            ORDER BY depends_on_id ASC",
        )
        .bind(id)
        .fetch_all(executor)
        .await
    }

    /// Deletes failed tombstones.
    pub(crate) async fn purge_tombstones(executor: impl SqliteExecutor<'_>) -> sqlx::Result<u64> {
        let result = query("DELETE FROM job_queue WHERE state = 'failed'")
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }
}
