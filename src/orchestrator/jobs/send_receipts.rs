// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, query};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    capability::{NetworkRequest, NetworkResponse},
    identifiers::ThreadId,
    scheduler::job::{Executable, JobContext, JobOutcome},
};

#[derive(Debug, Serialize, Deserialize)]
pub struct SendReceiptsPayload {
    pub thread_id: ThreadId,
}

/// Drains the queued delivery/read receipts of one thread in a single
/// batched request.
///
/// Receipt jobs are serialized per thread through their queue key, so one
/// claim owns every queued row, including rows left claimed by a crashed
/// attempt.
pub struct SendReceiptsJob {
    payload: SendReceiptsPayload,
}

#[derive(FromRow)]
struct QueuedReceipt {
    message_id: String,
    status: String,
}

impl SendReceiptsJob {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            payload: SendReceiptsPayload { thread_id },
        }
    }

    pub(crate) fn from_payload(payload: &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            payload: serde_json::from_slice(payload)?,
        })
    }

    pub fn payload_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.payload).expect("infallible serialization")
    }

    async fn run_attempt(&self, ctx: &JobContext) -> anyhow::Result<JobOutcome> {
        let thread_id = self.payload.thread_id;
        let lock = Uuid::new_v4().to_string();
        query("UPDATE receipt_queue SET locked_by = ? WHERE thread_id = ?")
            .bind(&lock)
            .bind(thread_id)
            .execute(&ctx.pool)
            .await?;
        let claimed: Vec<QueuedReceipt> =
            sqlx::query_as("SELECT message_id, status FROM receipt_queue WHERE locked_by = ?")
                .bind(&lock)
                .fetch_all(&ctx.pool)
                .await?;
        if claimed.is_empty() {
            return Ok(JobOutcome::Success);
        }

        debug!(%thread_id, count = claimed.len(), "sending batched receipts");
        let receipts = claimed
            .into_iter()
            .map(|receipt| (receipt.message_id, receipt.status))
            .collect();
        let response = ctx
            .network
            .perform(NetworkRequest::SendReceipts {
                thread: thread_id.to_string(),
                receipts,
            })
            .await;

        match response {
            NetworkResponse::Success(_) => {
                query("DELETE FROM receipt_queue WHERE locked_by = ?")
                    .bind(&lock)
                    .execute(&ctx.pool)
                    .await?;
                Ok(JobOutcome::Success)
            }
            NetworkResponse::NetworkFailure => {
                self.release(ctx, &lock).await?;
                Ok(JobOutcome::retry())
            }
            NetworkResponse::RateLimited { retry_after } => {
                self.release(ctx, &lock).await?;
                Ok(JobOutcome::RateLimited { retry_after })
            }
            NetworkResponse::PermanentFailure { code } => {
                // Receipts are best effort; drop them rather than retrying a
                // request the server will keep rejecting.
                warn!(code, %thread_id, "server rejected receipts; dropping batch");
                query("DELETE FROM receipt_queue WHERE locked_by = ?")
                    .bind(&lock)
                    .execute(&ctx.pool)
                    .await?;
                Ok(JobOutcome::Success)
            }
        }
    }

    async fn release(&self, ctx: &JobContext, lock: &str) -> sqlx::Result<()> {
        query("UPDATE receipt_queue SET locked_by = NULL WHERE locked_by = ?")
            .bind(lock)
            .execute(&ctx.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Executable for SendReceiptsJob {
    async fn run(&mut self, ctx: &JobContext) -> JobOutcome {
        match self.run_attempt(ctx).await {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(%error, thread_id = %self.payload.thread_id, "receipt batch errored");
                JobOutcome::retry()
            }
        }
    }
}
