// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The send orchestration layer on top of the job scheduler.
//!
//! The orchestrator turns one user-visible send into a durable outbox record
//! plus a dependency chain of jobs (compress → upload per attachment, then
//! the send itself), persisted in a single transaction. Follow-up operations
//! (retries, identity resolution, receipts, maintenance) are expressed as
//! further jobs on the same scheduler.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    constraints,
    events::OutboundEvent,
    graph::JobChainBuilder,
    identifiers::{JobId, OutboxMessageId, RecipientId, ThreadId},
    scheduler::{
        JobScheduler,
        job::{JOB_SCHEMA_VERSION, JobRecord, NewJob},
    },
    utils::connection_ext::StoreExt,
};

pub mod attachment;
pub mod jobs;
pub mod outbox;
pub mod reconcile;

use attachment::AttachmentRecord;
use jobs::{
    CompressAttachmentJob, RefreshAttributesJob, RotateKeysJob, SendMessagePayload,
    SendReceiptsJob, UploadAttachmentJob,
};
use outbox::{OutboxMessage, SendState, SendTarget};

/// How long a send may keep retrying before it fails permanently.
const SEND_LIFESPAN: Duration = Duration::from_secs(24 * 60 * 60);

const MAINTENANCE_QUEUE: &str = "maintenance";

/// What happens to recipients skipped during a send (unregistered accounts,
/// unusable pre-key bundles) when the message is sent again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkippedRecipientPolicy {
    /// Skips apply to the attempt only; a full resend re-addresses them.
    #[default]
    RetryOnResend,
    /// Skips are recorded in a ledger and permanently excluded.
    NeverRetry,
}

/// A delivery or read receipt for a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Delivered,
    Read,
}

impl ReceiptStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Delivered => "delivered",
            ReceiptStatus::Read => "read",
        }
    }
}

/// A user-visible send before it is persisted.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub thread_id: ThreadId,
    pub target: SendTarget,
    pub body: Vec<u8>,
    /// Plaintext attachment contents.
    pub attachments: Vec<Vec<u8>>,
    pub expire_timer_seconds: Option<i64>,
}

pub struct SendOrchestrator {
    pool: SqlitePool,
    scheduler: Arc<JobScheduler>,
    skipped_policy: SkippedRecipientPolicy,
}

impl SendOrchestrator {
    pub fn new(
        pool: SqlitePool,
        scheduler: Arc<JobScheduler>,
        skipped_policy: SkippedRecipientPolicy,
    ) -> Self {
        Self {
            pool,
            scheduler,
            skipped_policy,
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OutboundEvent> {
        self.scheduler.events().subscribe()
    }

    /// Persists the draft and its job chain atomically, then wakes the
    /// scheduler.
    ///
    /// Attachments are deduplicated by content: the same bytes attached to
    /// several messages share one record and one compress/upload chain. The
    /// send job depends on every upload of this draft and is serialized with
    /// other sends to the same target through its queue key.
    pub async fn send(&self, draft: MessageDraft) -> anyhow::Result<OutboxMessageId> {
        let message = OutboxMessage::new(
            draft.thread_id,
            draft.target,
            draft.body,
            draft.expire_timer_seconds,
        );
        let message_id = message.id;

        let mut builder = JobChainBuilder::new();
        let mut records = Vec::new();
        let mut upload_jobs = HashSet::new();
        for content in draft.attachments {
            let record = AttachmentRecord::new(content);
            let attachment_id = record.id.clone();
            let node = builder.attachment_chain(attachment_id.clone(), || {
                let compress = NewJob::new(
                    jobs::keys::COMPRESS_ATTACHMENT,
                    CompressAttachmentJob::new(attachment_id.clone()).payload_bytes(),
                );
                let upload = NewJob::new(
                    jobs::keys::UPLOAD_ATTACHMENT,
                    UploadAttachmentJob::new(attachment_id.clone()).payload_bytes(),
                )
                .with_constraint(constraints::keys::NETWORK);
                (compress, upload)
            });
            upload_jobs.insert(node.upload_job);
            records.push(record);
        }

        let mut send_job = NewJob::new(
            jobs::keys::SEND_MESSAGE,
            serde_json::to_vec(&SendMessagePayload {
                message_id,
                filter_recipients: None,
                skipped_policy: self.skipped_policy,
            })?,
        )
        .with_queue_key(message.target.queue_key())
        .with_constraint(constraints::keys::NETWORK)
        .with_lifespan(SEND_LIFESPAN);
        for upload_job in upload_jobs {
            send_job = send_job.depends_on(upload_job);
        }
        builder.add(send_job);
        let jobs = builder.into_jobs()?;

        let now = Utc::now();
        self.pool
            .with_transaction(async |txn| {
                message.store(txn.as_mut()).await?;
                for record in &records {
                    record.store_if_new(txn.as_mut()).await?;
                    AttachmentRecord::link_to_message(txn.as_mut(), message_id, &record.id).await?;
                }
                for job in &jobs {
                    JobRecord::insert(txn, job, now, JOB_SCHEMA_VERSION).await?;
                }
                Ok(())
            })
            .await?;

        info!(%message_id, jobs = jobs.len(), "send persisted with job chain");
        self.scheduler.handle().notify_work();
        Ok(message_id)
    }

    /// Enqueues a new send attempt for a message that failed.
    ///
    /// The attempt re-addresses only the recipients still carried in the
    /// failure sets; with both sets empty it is a full resend.
    pub async fn retry_message(&self, message_id: OutboxMessageId) -> anyhow::Result<Option<JobId>> {
        let Some(message) = OutboxMessage::load(&self.pool, message_id).await? else {
            return Ok(None);
        };
        if message.send_state == SendState::Sent {
            return Ok(None);
        }
        let network_failures = OutboxMessage::network_failures(&self.pool, message_id).await?;
        let identity_mismatches =
            OutboxMessage::identity_mismatches(&self.pool, message_id).await?;
        let remaining: Vec<RecipientId> = network_failures
            .iter()
            .chain(identity_mismatches.keys())
            .copied()
            .collect();
        let filter_recipients = (!remaining.is_empty()).then_some(remaining);
        let job_id = self
            .enqueue_send(&message, filter_recipients)
            .await?;
        Ok(Some(job_id))
    }

    /// Accepts a recipient's new identity key and re-sends to them alone.
    pub async fn resolve_identity(
        &self,
        message_id: OutboxMessageId,
        recipient: RecipientId,
    ) -> anyhow::Result<Option<JobId>> {
        let Some(message) = OutboxMessage::load(&self.pool, message_id).await? else {
            return Ok(None);
        };
        OutboxMessage::resolve_identity_mismatch(&self.pool, message_id, recipient).await?;
        let job_id = self.enqueue_send(&message, Some(vec![recipient])).await?;
        Ok(Some(job_id))
    }

    async fn enqueue_send(
        &self,
        message: &OutboxMessage,
        filter_recipients: Option<Vec<RecipientId>>,
    ) -> anyhow::Result<JobId> {
        let job = NewJob::new(
            jobs::keys::SEND_MESSAGE,
            serde_json::to_vec(&SendMessagePayload {
                message_id: message.id,
                filter_recipients,
                skipped_policy: self.skipped_policy,
            })?,
        )
        .with_queue_key(message.target.queue_key())
        .with_constraint(constraints::keys::NETWORK)
        .with_lifespan(SEND_LIFESPAN);
        self.scheduler.enqueue(job).await
    }

    /// Queues a receipt and schedules a batched flush for its thread.
    ///
    /// Receipt jobs share a per-thread queue key, so concurrent flushes
    /// serialize and a single attempt drains everything queued so far.
    pub async fn queue_receipt(
        &self,
        thread_id: ThreadId,
        message_id: impl Into<String>,
        status: ReceiptStatus,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO receipt_queue (message_id, thread_id, status, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT DO NOTHING",
        )
        .bind(message_id.into())
        .bind(thread_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let job = NewJob::new(
            jobs::keys::SEND_RECEIPTS,
            SendReceiptsJob::new(thread_id).payload_bytes(),
        )
        .with_queue_key(format!("receipts:{thread_id}"))
        .with_constraint(constraints::keys::NETWORK);
        self.scheduler.enqueue(job).await?;
        Ok(())
    }

    /// Schedules a refresh of the server-side account attributes.
    pub async fn refresh_attributes(&self, attributes: Vec<u8>) -> anyhow::Result<JobId> {
        let job = NewJob::new(
            jobs::keys::REFRESH_ATTRIBUTES,
            RefreshAttributesJob::new(attributes).payload_bytes(),
        )
        .with_queue_key(MAINTENANCE_QUEUE)
        .with_constraint(constraints::keys::NETWORK);
        self.scheduler.enqueue(job).await
    }

    /// Schedules the upload of a fresh pre-key bundle.
    pub async fn rotate_keys(&self, bundle: Vec<u8>) -> anyhow::Result<JobId> {
        let job = NewJob::new(
            jobs::keys::ROTATE_KEYS,
            RotateKeysJob::new(bundle).payload_bytes(),
        )
        .with_queue_key(MAINTENANCE_QUEUE)
        .with_constraint(constraints::keys::NETWORK);
        self.scheduler.enqueue(job).await
    }

    /// Cancels every not-yet-started send to the given target.
    pub async fn cancel_pending_sends(&self, target: &SendTarget) -> anyhow::Result<u64> {
        self.scheduler.cancel_queue(&target.queue_key()).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex as StdMutex,
    };

    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::{
        capability::{
            CryptoCapability, EncryptError, NetworkCapability, NetworkRequest, NetworkResponse,
            ResponseBody, SystemClock,
        },
        config::SchedulerConfig,
        constraints::RuntimeState,
        events::EventSink,
        orchestrator::attachment::AttachmentStatus,
        scheduler::migrations::MigrationChain,
        store::testing::open_test_db,
        utils::init_test_tracing,
    };

    use super::*;

    /// A wire fake covering envelopes, uploads, receipts and maintenance.
    #[derive(Default)]
    struct ScriptedNetwork {
        inner: StdMutex<NetInner>,
    }

    #[derive(Default)]
    struct NetInner {
        envelope_scripts: HashMap<RecipientId, VecDeque<NetworkResponse>>,
        envelopes: Vec<RecipientId>,
        receipt_batches: Vec<Vec<(String, String)>>,
        attribute_calls: usize,
        uploads: HashMap<String, (u64, Vec<u8>)>,
        next_location: usize,
    }

    impl ScriptedNetwork {
        fn script_envelope(
            &self,
            recipient: RecipientId,
            responses: impl IntoIterator<Item = NetworkResponse>,
        ) {
            self.inner
                .lock()
                .unwrap()
                .envelope_scripts
                .insert(recipient, responses.into_iter().collect());
        }

        fn envelopes_to(&self, recipient: RecipientId) -> usize {
            self.inner
                .lock()
                .unwrap()
                .envelopes
                .iter()
                .filter(|sent| **sent == recipient)
                .count()
        }
    }

    #[async_trait]
    impl NetworkCapability for ScriptedNetwork {
        async fn perform(&self, request: NetworkRequest) -> NetworkResponse {
            let mut inner = self.inner.lock().unwrap();
            match request {
                NetworkRequest::SendEnvelope { recipient, .. } => {
                    inner.envelopes.push(recipient);
                    inner
                        .envelope_scripts
                        .get_mut(&recipient)
                        .and_then(VecDeque::pop_front)
                        .unwrap_or(NetworkResponse::Success(ResponseBody::Empty))
                }
                NetworkRequest::ProvisionUpload { size } => {
                    inner.next_location += 1;
                    let location = format!("upload/{}", inner.next_location);
                    inner.uploads.insert(location.clone(), (size, Vec::new()));
                    NetworkResponse::Success(ResponseBody::UploadProvisioned { location })
                }
                NetworkRequest::QueryUploadOffset { location } => {
                    let offset = inner
                        .uploads
                        .get(&location)
                        .map_or(0, |(_, committed)| committed.len() as u64);
                    NetworkResponse::Success(ResponseBody::UploadOffset { offset })
                }
                NetworkRequest::UploadRange {
                    location, bytes, ..
                } => {
                    let Some((size, committed)) = inner.uploads.get_mut(&location) else {
                        return NetworkResponse::PermanentFailure { code: 404 };
                    };
                    committed.extend_from_slice(&bytes);
                    if committed.len() as u64 >= *size {
                        let digest = Sha256::digest(&committed).to_vec();
                        NetworkResponse::Success(ResponseBody::UploadComplete { digest })
                    } else {
                        NetworkResponse::Success(ResponseBody::Empty)
                    }
                }
                NetworkRequest::SendReceipts { receipts, .. } => {
                    inner.receipt_batches.push(receipts);
                    NetworkResponse::Success(ResponseBody::Empty)
                }
                NetworkRequest::SetAccountAttributes { .. } => {
                    inner.attribute_calls += 1;
                    NetworkResponse::Success(ResponseBody::Empty)
                }
                NetworkRequest::RotateKeys { .. } => {
                    NetworkResponse::Success(ResponseBody::Empty)
                }
            }
        }
    }

    #[derive(Default)]
    struct ScriptedCrypto {
        untrusted: StdMutex<HashMap<RecipientId, Vec<u8>>>,
    }

    impl ScriptedCrypto {
        fn distrust(&self, recipient: RecipientId, identity_key: Vec<u8>) {
            self.untrusted
                .lock()
                .unwrap()
                .insert(recipient, identity_key);
        }

        fn trust(&self, recipient: RecipientId) {
            self.untrusted.lock().unwrap().remove(&recipient);
        }
    }

    #[async_trait]
    impl CryptoCapability for ScriptedCrypto {
        async fn encrypt_and_envelope(
            &self,
            plaintext: &[u8],
            recipient: RecipientId,
        ) -> Result<Vec<u8>, EncryptError> {
            if let Some(identity_key) = self.untrusted.lock().unwrap().get(&recipient) {
                return Err(EncryptError::UntrustedIdentity {
                    recipient,
                    identity_key: identity_key.clone(),
                });
            }
            Ok(plaintext.to_vec())
        }
    }

    struct Bench {
        orchestrator: SendOrchestrator,
        scheduler: Arc<JobScheduler>,
        network: Arc<ScriptedNetwork>,
        crypto: Arc<ScriptedCrypto>,
        events: mpsc::UnboundedReceiver<OutboundEvent>,
        pool: SqlitePool,
        _dir: TempDir,
    }

    async fn bench(policy: SkippedRecipientPolicy) -> Bench {
        init_test_tracing();
        let (pool, dir) = open_test_db().await;
        let network = Arc::new(ScriptedNetwork::default());
        let crypto = Arc::new(ScriptedCrypto::default());
        let config = SchedulerConfig {
            worker_slots: 4,
            base_backoff_ms: 10,
            max_backoff_ms: 100,
            rate_limit_backoff_ms: 20,
            upload_chunk_size: 16,
        };
        let scheduler = Arc::new(JobScheduler::new(
            pool.clone(),
            jobs::registry(),
            MigrationChain::new(JOB_SCHEMA_VERSION),
            RuntimeState::default().registry(),
            config,
            network.clone(),
            crypto.clone(),
            Arc::new(SystemClock),
            EventSink::new(),
        ));
        let orchestrator = SendOrchestrator::new(pool.clone(), scheduler.clone(), policy);
        let events = orchestrator.subscribe();
        Bench {
            orchestrator,
            scheduler,
            network,
            crypto,
            events,
            pool,
            _dir: dir,
        }
    }

    async fn await_event(
        events: &mut mpsc::UnboundedReceiver<OutboundEvent>,
        mut matches: impl FnMut(&OutboundEvent) -> bool,
    ) -> OutboundEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event sink closed");
            if matches(&event) {
                return event;
            }
        }
    }

    fn group_draft(members: Vec<RecipientId>, attachments: Vec<Vec<u8>>) -> MessageDraft {
        MessageDraft {
            thread_id: ThreadId::random(),
            target: SendTarget::Group {
                group_id: Uuid::new_v4(),
                members,
            },
            body: b"hello".to_vec(),
            attachments,
            expire_timer_seconds: None,
        }
    }

    #[tokio::test]
    async fn sends_a_message_with_attachment_end_to_end() {
        let mut bench = bench(SkippedRecipientPolicy::default()).await;
        let (a, b) = (RecipientId::random(), RecipientId::random());
        let draft = group_draft(vec![a, b], vec![b"attachment bytes".to_vec()]);
        let attachment_id = crate::identifiers::AttachmentId::for_content(b"attachment bytes");

        bench.scheduler.start();
        let message_id = bench.orchestrator.send(draft).await.unwrap();
        await_event(&mut bench.events, |event| {
            matches!(event, OutboundEvent::MessageSent { .. })
        })
        .await;
        bench.scheduler.stop().await;

        let message = OutboxMessage::load(&bench.pool, message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.send_state, SendState::Sent);
        let record = AttachmentRecord::load(&bench.pool, &attachment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, AttachmentStatus::Uploaded);
        assert!(record.upload_location.is_some());
        assert_eq!(bench.network.envelopes_to(a), 1);
        assert_eq!(bench.network.envelopes_to(b), 1);
    }

    #[tokio::test]
    async fn network_failures_are_retried_for_failed_recipients_only() {
        let mut bench = bench(SkippedRecipientPolicy::default()).await;
        let (a, b) = (RecipientId::random(), RecipientId::random());
        bench
            .network
            .script_envelope(b, [NetworkResponse::NetworkFailure]);

        bench.scheduler.start();
        bench
            .orchestrator
            .send(group_draft(vec![a, b], Vec::new()))
            .await
            .unwrap();
        await_event(&mut bench.events, |event| {
            matches!(event, OutboundEvent::MessageSent { .. })
        })
        .await;
        bench.scheduler.stop().await;

        // The retry re-addressed only the failed recipient.
        assert_eq!(bench.network.envelopes_to(a), 1);
        assert_eq!(bench.network.envelopes_to(b), 2);
    }

    #[tokio::test]
    async fn identity_mismatch_fails_the_message_until_resolved() {
        let mut bench = bench(SkippedRecipientPolicy::default()).await;
        let (a, c) = (RecipientId::random(), RecipientId::random());
        bench.crypto.distrust(c, vec![9, 9, 9]);

        bench.scheduler.start();
        let message_id = bench
            .orchestrator
            .send(group_draft(vec![a, c], Vec::new()))
            .await
            .unwrap();

        let mismatch = await_event(&mut bench.events, |event| {
            matches!(event, OutboundEvent::IdentityMismatch { .. })
        })
        .await;
        assert_eq!(
            mismatch,
            OutboundEvent::IdentityMismatch {
                message_id,
                recipient: c,
            }
        );
        await_event(&mut bench.events, |event| {
            matches!(event, OutboundEvent::MessageFailed { .. })
        })
        .await;

        let message = OutboxMessage::load(&bench.pool, message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.send_state, SendState::Failed);
        let mismatches = OutboxMessage::identity_mismatches(&bench.pool, message_id)
            .await
            .unwrap();
        assert_eq!(mismatches.get(&c), Some(&vec![9, 9, 9]));

        // The user re-verifies the new key; the resend targets only them.
        bench.crypto.trust(c);
        bench
            .orchestrator
            .resolve_identity(message_id, c)
            .await
            .unwrap()
            .expect("message still exists");
        await_event(&mut bench.events, |event| {
            matches!(event, OutboundEvent::MessageSent { .. })
        })
        .await;
        bench.scheduler.stop().await;

        // The mismatch surfaced before any envelope left for c; only the
        // resend reaches the network, and only for c.
        assert_eq!(bench.network.envelopes_to(a), 1);
        assert_eq!(bench.network.envelopes_to(c), 1);
        let message = OutboxMessage::load(&bench.pool, message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.send_state, SendState::Sent);
    }

    #[tokio::test]
    async fn unregistered_recipients_are_skipped_not_failed() {
        let mut bench = bench(SkippedRecipientPolicy::NeverRetry).await;
        let (a, b) = (RecipientId::random(), RecipientId::random());
        bench
            .network
            .script_envelope(b, [NetworkResponse::PermanentFailure { code: 404 }]);

        bench.scheduler.start();
        let message_id = bench
            .orchestrator
            .send(group_draft(vec![a, b], Vec::new()))
            .await
            .unwrap();
        await_event(&mut bench.events, |event| {
            matches!(event, OutboundEvent::MessageSent { .. })
        })
        .await;
        bench.scheduler.stop().await;

        let skipped = OutboxMessage::skipped_ledger(&bench.pool, message_id)
            .await
            .unwrap();
        assert_eq!(skipped, HashSet::from([b]));
        assert_eq!(bench.network.envelopes_to(b), 1);
    }

    #[tokio::test]
    async fn receipts_for_a_thread_flush_in_one_batch() {
        let mut bench = bench(SkippedRecipientPolicy::default()).await;
        let thread_id = ThreadId::random();
        bench
            .orchestrator
            .queue_receipt(thread_id, "msg-1", ReceiptStatus::Delivered)
            .await
            .unwrap();
        bench
            .orchestrator
            .queue_receipt(thread_id, "msg-2", ReceiptStatus::Read)
            .await
            .unwrap();

        bench.scheduler.run_once().await;

        let batches = bench.network.inner.lock().unwrap().receipt_batches.clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM receipt_queue")
            .fetch_one(&bench.pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn attribute_refresh_runs_once_per_cycle() {
        let bench = bench(SkippedRecipientPolicy::default()).await;
        bench
            .orchestrator
            .refresh_attributes(b"attrs".to_vec())
            .await
            .unwrap();
        bench
            .orchestrator
            .refresh_attributes(b"attrs".to_vec())
            .await
            .unwrap();

        bench.scheduler.run_once().await;

        assert_eq!(bench.network.inner.lock().unwrap().attribute_calls, 1);
    }

    #[tokio::test]
    async fn pending_sends_to_a_target_can_be_cancelled() {
        let mut bench = bench(SkippedRecipientPolicy::default()).await;
        let target = SendTarget::Single {
            recipient: RecipientId::random(),
        };
        let draft = MessageDraft {
            thread_id: ThreadId::random(),
            target: target.clone(),
            body: b"unsent".to_vec(),
            attachments: Vec::new(),
            expire_timer_seconds: None,
        };
        bench.orchestrator.send(draft).await.unwrap();

        let cancelled = bench
            .orchestrator
            .cancel_pending_sends(&target)
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        bench.scheduler.run_once().await;
        assert!(bench.network.inner.lock().unwrap().envelopes.is_empty());
    }
}
