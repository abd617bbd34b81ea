// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    identifiers::AttachmentId,
    orchestrator::attachment::{AttachmentRecord, AttachmentStatus},
    scheduler::job::{Executable, JobContext, JobOutcome},
    upload::{ResumableUpload, UploadError},
};

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadAttachmentPayload {
    pub attachment_id: AttachmentId,
}

/// Uploads a compressed attachment via the resumable upload sub-protocol.
///
/// The provisioned upload location is persisted before the first byte is
/// transferred; a retry after a crash or a transient failure resumes at the
/// server's committed offset instead of starting over.
pub struct UploadAttachmentJob {
    payload: UploadAttachmentPayload,
}

impl UploadAttachmentJob {
    pub fn new(attachment_id: AttachmentId) -> Self {
        Self {
            payload: UploadAttachmentPayload { attachment_id },
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
        match record.status {
            AttachmentStatus::Uploaded => return Ok(JobOutcome::Success),
            AttachmentStatus::Compressed | AttachmentStatus::Uploading => {}
            other => {
                return Ok(JobOutcome::failure(anyhow::anyhow!(
                    "attachment {id} is not ready for upload (status {other:?})"
                )));
            }
        }
        let Some(content) = record.compressed else {
            return Ok(JobOutcome::failure(anyhow::anyhow!(
                "attachment {id} has no compressed content"
            )));
        };

        let upload = ResumableUpload::new(ctx.network.as_ref(), ctx.config.upload_chunk_size);
        let location = match record.upload_location {
            Some(location) => location,
            None => {
                let location = match upload.provision(content.len() as u64).await {
                    Ok(location) => location,
                    Err(error) => return Ok(upload_outcome(id, error)),
                };
                AttachmentRecord::set_upload_location(&ctx.pool, id, &location).await?;
                location
            }
        };

        match upload.resume(&location, &content).await {
            Ok(digest) => {
                AttachmentRecord::mark_uploaded(&ctx.pool, id, &digest).await?;
                info!(%id, location, "attachment uploaded and digest-verified");
                Ok(JobOutcome::Success)
            }
            Err(error) => Ok(upload_outcome(id, error)),
        }
    }
}

fn upload_outcome(id: &AttachmentId, error: UploadError) -> JobOutcome {
    match error {
        UploadError::Transient => JobOutcome::retry(),
        UploadError::RateLimited(retry_after) => JobOutcome::RateLimited { retry_after },
        error => {
            error!(%error, %id, "upload failed permanently");
            JobOutcome::failure(error)
        }
    }
}

#[async_trait]
impl Executable for UploadAttachmentJob {
    async fn run(&mut self, ctx: &JobContext) -> JobOutcome {
        match self.run_attempt(ctx).await {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(%error, id = %self.payload.attachment_id, "upload attempt errored");
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
