// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Delivery of an outbox message to all of its addressed recipients.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    capability::{EncryptError, NetworkRequest, NetworkResponse},
    events::OutboundEvent,
    identifiers::{OutboxMessageId, RecipientId, ThreadId},
    orchestrator::{
        SkippedRecipientPolicy,
        attachment::AttachmentRecord,
        outbox::{OutboxMessage, SendState},
        reconcile::{PriorFailures, RecipientSendResult, SendDecision, reconcile},
    },
    scheduler::job::{Executable, JobContext, JobOutcome},
    utils::connection_ext::StoreExt,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub message_id: OutboxMessageId,
    /// Restrict this attempt to a subset of recipients (manual retry).
    #[serde(default)]
    pub filter_recipients: Option<Vec<RecipientId>>,
    #[serde(default)]
    pub skipped_policy: SkippedRecipientPolicy,
}

pub struct SendMessageJob {
    payload: SendMessagePayload,
}

/// The wire-level plaintext handed to the encryption capability, one copy
/// per recipient.
#[derive(Serialize)]
struct Envelope<'a> {
    thread_id: ThreadId,
    body: &'a [u8],
    attachments: &'a [String],
    expire_timer_seconds: Option<i64>,
}

impl SendMessageJob {
    pub fn new(payload: SendMessagePayload) -> Self {
        Self { payload }
    }

    pub(crate) fn from_payload(payload: &[u8]) -> anyhow::Result<Self> {
        Ok(Self::new(serde_json::from_slice(payload)?))
    }

    /// The recipients this attempt addresses.
    ///
    /// A filtered attempt addresses exactly the filter. Otherwise a retry
    /// re-addresses only the carried failure sets; a first attempt addresses
    /// the full target. Skipped recipients are excluded under the never-retry
    /// policy.
    fn targets(
        &self,
        message: &OutboxMessage,
        prior: &PriorFailures,
        skipped: &HashSet<RecipientId>,
    ) -> Vec<RecipientId> {
        let base: Vec<RecipientId> = if let Some(filter) = &self.payload.filter_recipients {
            filter.clone()
        } else if !prior.network_failures.is_empty() || !prior.identity_mismatches.is_empty() {
            prior
                .network_failures
                .iter()
                .chain(prior.identity_mismatches.keys())
                .copied()
                .collect()
        } else {
            message.target.recipients()
        };
        match self.payload.skipped_policy {
            SkippedRecipientPolicy::RetryOnResend => base,
            SkippedRecipientPolicy::NeverRetry => base
                .into_iter()
                .filter(|recipient| !skipped.contains(recipient))
                .collect(),
        }
    }

    async fn deliver(
        &self,
        ctx: &JobContext,
        recipient: RecipientId,
        plaintext: &[u8],
    ) -> RecipientSendResult {
        let ciphertext = match ctx.crypto.encrypt_and_envelope(plaintext, recipient).await {
            Ok(ciphertext) => ciphertext,
            Err(EncryptError::UntrustedIdentity { identity_key, .. }) => {
                return RecipientSendResult::IdentityMismatch { identity_key };
            }
            Err(EncryptError::InvalidPreKeyBundle { .. }) => {
                return RecipientSendResult::InvalidPreKeyBundle;
            }
        };
        match ctx
            .network
            .perform(NetworkRequest::SendEnvelope {
                recipient,
                ciphertext,
            })
            .await
        {
            NetworkResponse::Success(_) => RecipientSendResult::Success,
            NetworkResponse::NetworkFailure => RecipientSendResult::NetworkFailure,
            NetworkResponse::RateLimited { retry_after } => {
                RecipientSendResult::RateLimited { retry_after }
            }
            // Gone accounts are skipped, not failed.
            NetworkResponse::PermanentFailure { code: 404 | 410 } => {
                RecipientSendResult::Unregistered
            }
            // Any other permanent rejection cannot succeed on retry either;
            // the recipient is dropped instead of holding the queue head.
            NetworkResponse::PermanentFailure { code } => {
                warn!(code, %recipient, "server permanently rejected envelope; dropping recipient");
                RecipientSendResult::Rejected
            }
        }
    }

    async fn run_attempt(&self, ctx: &JobContext) -> anyhow::Result<JobOutcome> {
        let message_id = self.payload.message_id;
        let Some(message) = OutboxMessage::load(&ctx.pool, message_id).await? else {
            warn!(%message_id, "outbox message is gone; nothing to send");
            return Ok(JobOutcome::Success);
        };
        if message.send_state == SendState::Sent {
            return Ok(JobOutcome::Success);
        }
        OutboxMessage::mark_sending_if_pending(&ctx.pool, message_id).await?;

        let prior = PriorFailures {
            network_failures: OutboxMessage::network_failures(&ctx.pool, message_id).await?,
            identity_mismatches: OutboxMessage::identity_mismatches(&ctx.pool, message_id).await?,
        };
        let skipped = OutboxMessage::skipped_ledger(&ctx.pool, message_id).await?;
        let attachments =
            AttachmentRecord::uploaded_locations_for_message(&ctx.pool, message_id).await?;
        let plaintext = serde_json::to_vec(&Envelope {
            thread_id: message.thread_id,
            body: &message.body,
            attachments: &attachments,
            expire_timer_seconds: message.expire_timer_seconds,
        })?;

        let targets = self.targets(&message, &prior, &skipped);
        let mut results = Vec::with_capacity(targets.len());
        for recipient in targets {
            let result = self.deliver(ctx, recipient, &plaintext).await;
            results.push((recipient, result));
        }

        let outcome = reconcile(&prior, &results);

        let record_skips = matches!(
            self.payload.skipped_policy,
            SkippedRecipientPolicy::NeverRetry
        );
        ctx.pool
            .with_transaction(async |txn| {
                OutboxMessage::replace_network_failures(txn, message_id, &outcome.network_failures)
                    .await?;
                OutboxMessage::replace_identity_mismatches(
                    txn,
                    message_id,
                    &outcome.identity_mismatches,
                )
                .await?;
                if record_skips {
                    OutboxMessage::add_skipped(txn, message_id, &outcome.newly_skipped).await?;
                }
                Ok(())
            })
            .await?;

        for recipient in outcome.identity_mismatches.keys() {
            if !prior.identity_mismatches.contains_key(recipient) {
                ctx.events.emit(OutboundEvent::IdentityMismatch {
                    message_id,
                    recipient: *recipient,
                });
            }
        }

        Ok(match outcome.decision {
            SendDecision::Sent => {
                OutboxMessage::set_state(&ctx.pool, message_id, SendState::Sent).await?;
                info!(%message_id, "message sent to all addressed recipients");
                ctx.events.emit(OutboundEvent::MessageSent { message_id });
                JobOutcome::Success
            }
            SendDecision::RetryNetwork => {
                info!(
                    %message_id,
                    remaining = outcome.network_failures.len(),
                    "network failures remain; retrying"
                );
                JobOutcome::retry()
            }
            SendDecision::FailedIdentity => JobOutcome::failure(anyhow::anyhow!(
                "identity mismatches remain for message {message_id}"
            )),
            SendDecision::RateLimited { retry_after } => JobOutcome::RateLimited { retry_after },
        })
    }
}

#[async_trait]
impl Executable for SendMessageJob {
    async fn run(&mut self, ctx: &JobContext) -> JobOutcome {
        match self.run_attempt(ctx).await {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(%error, message_id = %self.payload.message_id, "send attempt errored");
                JobOutcome::retry()
            }
        }
    }

    async fn on_failure(&mut self, ctx: &JobContext) {
        let message_id = self.payload.message_id;
        match OutboxMessage::load(&ctx.pool, message_id).await {
            Ok(Some(message)) if message.send_state != SendState::Sent => {
                if let Err(error) =
                    OutboxMessage::set_state(&ctx.pool, message_id, SendState::Failed).await
                {
                    error!(%error, %message_id, "failed to mark message as failed");
                }
                ctx.events.emit(OutboundEvent::MessageFailed { message_id });
            }
            Ok(_) => {}
            Err(error) => {
                error!(%error, %message_id, "failed to load message in failure callback");
            }
        }
    }
}
