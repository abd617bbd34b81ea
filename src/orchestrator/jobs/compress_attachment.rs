// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::io::Write;

use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{
    identifiers::AttachmentId,
    orchestrator::attachment::{AttachmentRecord, AttachmentStatus},
    scheduler::job::{Executable, JobContext, JobOutcome},
};

#[derive(Debug, Serialize, Deserialize)]
pub struct CompressAttachmentPayload {
    pub attachment_id: AttachmentId,
}

/// Gzip-compresses an attachment's plaintext ahead of upload.
pub struct CompressAttachmentJob {
    payload: CompressAttachmentPayload,
}

impl CompressAttachmentJob {
    pub fn new(attachment_id: AttachmentId) -> Self {
        Self {
            payload: CompressAttachmentPayload { attachment_id },
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
        let id = &self.payload.attachment_id;
        let Some(record) = AttachmentRecord::load(&ctx.pool, id).await? else {
            return Ok(JobOutcome::failure(anyhow::anyhow!(
                "attachment {id} is gone"
            )));
        };
        // A replayed record may already be past this step.
        if record.status != AttachmentStatus::Pending {
            return Ok(JobOutcome::Success);
        }
        let Some(plaintext) = record.plaintext else {
            return Ok(JobOutcome::failure(anyhow::anyhow!(
                "pending attachment {id} has no plaintext"
            )));
        };

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plaintext)?;
        let compressed = encoder.finish()?;
        debug!(
            %id,
            plaintext_len = plaintext.len(),
            compressed_len = compressed.len(),
            "compressed attachment"
        );

        AttachmentRecord::set_compressed(&ctx.pool, id, &compressed).await?;
        Ok(JobOutcome::Success)
    }
}

#[async_trait]
impl Executable for CompressAttachmentJob {
    async fn run(&mut self, ctx: &JobContext) -> JobOutcome {
        match self.run_attempt(ctx).await {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(%error, id = %self.payload.attachment_id, "compression attempt errored");
                JobOutcome::retry()
            }
        }
    }

    async fn on_failure(&mut self, ctx: &JobContext) {
        if let Err(error) =
            AttachmentRecord::mark_failed(&ctx.pool, &self.payload.attachment_id).await
        {
            error!(%error, id = %self.payload.attachment_id, "failed to mark attachment as failed");
        }
    }
}
