// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The job types the send orchestrator enqueues.
//!
//! Each job type is registered under a stable factory key; the payloads are
//! JSON so that records written by older application versions stay readable
//! by the migration chain.

use anyhow::anyhow;

use crate::{
    capability::NetworkResponse,
    scheduler::job::{JobOutcome, JobRegistry},
};

mod compress_attachment;
mod refresh_attributes;
mod rotate_keys;
mod send_message;
mod send_receipts;
mod upload_attachment;

pub use compress_attachment::CompressAttachmentJob;
pub use refresh_attributes::RefreshAttributesJob;
pub use rotate_keys::RotateKeysJob;
pub use send_message::{SendMessageJob, SendMessagePayload};
pub use send_receipts::SendReceiptsJob;
pub use upload_attachment::UploadAttachmentJob;

pub mod keys {
    pub const SEND_MESSAGE: &str = "send-message";
    pub const COMPRESS_ATTACHMENT: &str = "compress-attachment";
    pub const UPLOAD_ATTACHMENT: &str = "upload-attachment";
    pub const SEND_RECEIPTS: &str = "send-receipts";
    pub const REFRESH_ATTRIBUTES: &str = "refresh-attributes";
    pub const ROTATE_KEYS: &str = "rotate-keys";
}

/// The registry of all job types known to this application version.
pub fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register(keys::SEND_MESSAGE, |payload| {
        Ok(Box::new(SendMessageJob::from_payload(payload)?) as _)
    });
    registry.register(keys::COMPRESS_ATTACHMENT, |payload| {
        Ok(Box::new(CompressAttachmentJob::from_payload(payload)?) as _)
    });
    registry.register(keys::UPLOAD_ATTACHMENT, |payload| {
        Ok(Box::new(UploadAttachmentJob::from_payload(payload)?) as _)
    });
    registry.register(keys::SEND_RECEIPTS, |payload| {
        Ok(Box::new(SendReceiptsJob::from_payload(payload)?) as _)
    });
    registry.register(keys::REFRESH_ATTRIBUTES, |payload| {
        Ok(Box::new(RefreshAttributesJob::from_payload(payload)?) as _)
    });
    registry.register(keys::ROTATE_KEYS, |payload| {
        Ok(Box::new(RotateKeysJob::from_payload(payload)?) as _)
    });
    registry
}

/// Outcome mapping for jobs whose whole attempt is one network operation.
pub(crate) fn single_request_outcome(response: NetworkResponse) -> JobOutcome {
    match response {
        NetworkResponse::Success(_) => JobOutcome::Success,
        NetworkResponse::NetworkFailure => JobOutcome::retry(),
        NetworkResponse::RateLimited { retry_after } => JobOutcome::RateLimited { retry_after },
        NetworkResponse::PermanentFailure { code } => {
            JobOutcome::failure(anyhow!("server rejected request (code {code})"))
        }
    }
}
