// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The durable record of a logical send operation, distinct from the jobs
//! that implement it.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    Database, Decode, Encode, Sqlite, Type, encode::IsNull, error::BoxDynError,
    sqlite::SqliteTypeInfo,
};
use uuid::Uuid;

use crate::identifiers::{OutboxMessageId, RecipientId, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Pending,
    Sending,
    Sent,
    Failed,
}

/// The logical addressee of a send operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendTarget {
    Single {
        recipient: RecipientId,
    },
    Group {
        group_id: Uuid,
        members: Vec<RecipientId>,
    },
    DistributionList {
        list_id: Uuid,
        members: Vec<RecipientId>,
    },
}

impl SendTarget {
    /// The serialization domain of sends to this target.
    ///
    /// All sends to the same conversation share the key and therefore
    /// execute in submission order.
    pub fn queue_key(&self) -> String {
        match self {
            SendTarget::Single { recipient } => format!("send:recipient:{recipient}"),
            SendTarget::Group { group_id, .. } => format!("send:group:{group_id}"),
            SendTarget::DistributionList { list_id, .. } => format!("send:list:{list_id}"),
        }
    }

    pub fn recipients(&self) -> Vec<RecipientId> {
        match self {
            SendTarget::Single { recipient } => vec![*recipient],
            SendTarget::Group { members, .. } | SendTarget::DistributionList { members, .. } => {
                members.clone()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub id: OutboxMessageId,
    pub thread_id: ThreadId,
    pub target: SendTarget,
    pub body: Vec<u8>,
    pub send_state: SendState,
    pub expire_timer_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn new(
        thread_id: ThreadId,
        target: SendTarget,
        body: Vec<u8>,
        expire_timer_seconds: Option<i64>,
    ) -> Self {
        Self {
            id: OutboxMessageId::random(),
            thread_id,
            target,
            body,
            send_state: SendState::Pending,
            expire_timer_seconds,
            created_at: Utc::now(),
        }
    }
}

mod persistence {
    use sqlx::{FromRow, SqliteExecutor, SqliteTransaction, query, query_scalar};
    use tracing::debug;

    use super::*;

    #[derive(FromRow)]
    struct SqlOutboxMessage {
        id: OutboxMessageId,
        thread_id: ThreadId,
        target: String,
        body: Vec<u8>,
        send_state: SendState,
        expire_timer_seconds: Option<i64>,
        created_at: DateTime<Utc>,
    }

    impl TryFrom<SqlOutboxMessage> for OutboxMessage {
        type Error = sqlx::Error;

        fn try_from(record: SqlOutboxMessage) -> Result<Self, Self::Error> {
            let target = serde_json::from_str(&record.target)
                .map_err(|error| sqlx::Error::Decode(error.into()))?;
            Ok(Self {
                id: record.id,
                thread_id: record.thread_id,
                target,
                body: record.body,
                send_state: record.send_state,
                expire_timer_seconds: record.expire_timer_seconds,
                created_at: record.created_at,
            })
        }
    }

    impl OutboxMessage {
        pub(crate) async fn store(&self, executor: impl SqliteExecutor<'_>) -> sqlx::Result<()> {
            debug!(id = %self.id, thread_id = %self.thread_id, "storing outbox message");
            let target =
                serde_json::to_string(&self.target).expect("infallible serialization");
            query(
                "INSERT INTO outbox_message
                    (id, thread_id, target, body, send_state, expire_timer_seconds, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(self.id)
            .bind(self.thread_id)
            .bind(target)
            .bind(&self.body)
            .bind(self.send_state)
            .bind(self.expire_timer_seconds)
            .bind(self.created_at)
            .execute(executor)
            .await?;
            Ok(())
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            id: OutboxMessageId,
        ) -> sqlx::Result<Option<Self>> {
            let record: Option<SqlOutboxMessage> = sqlx::query_as(
                "SELECT id, thread_id, target, body, send_state, expire_timer_seconds, created_at
                FROM outbox_message
                WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(executor)
            .await?;
            record.map(Self::try_from).transpose()
        }

        pub(crate) async fn set_state(
            executor: impl SqliteExecutor<'_>,
            id: OutboxMessageId,
            send_state: SendState,
        ) -> sqlx::Result<()> {
            query("UPDATE outbox_message SET send_state = ? WHERE id = ?")
                .bind(send_state)
                .bind(id)
                .execute(executor)
                .await?;
            Ok(())
        }

        /// Transitions PENDING → SENDING when the first send job for the
        /// message is accepted. Returns whether the transition happened.
        pub(crate) async fn mark_sending_if_pending(
            executor: impl SqliteExecutor<'_>,
            id: OutboxMessageId,
        ) -> sqlx::Result<bool> {
            let result = query(
                "UPDATE outbox_message
                SET send_state = 'sending'
                WHERE id = ? AND send_state = 'pending'",
            )
            .bind(id)
            .execute(executor)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        pub(crate) async fn network_failures(
            executor: impl SqliteExecutor<'_>,
            id: OutboxMessageId,
        ) -> sqlx::Result<HashSet<RecipientId>> {
            let recipients: Vec<RecipientId> = query_scalar(
                "SELECT recipient_id FROM outbox_network_failure WHERE message_id = ?",
            )
            .bind(id)
            .fetch_all(executor)
            .await?;
            Ok(recipients.into_iter().collect())
        }

        pub(crate) async fn replace_network_failures(
            txn: &mut SqliteTransaction<'_>,
            id: OutboxMessageId,
            failures: &HashSet<RecipientId>,
        ) -> sqlx::Result<()> {
            query("DELETE FROM outbox_network_failure WHERE message_id = ?")
                .bind(id)
                .execute(txn.as_mut())
                .await?;
            for recipient in failures {
                query(
                    "INSERT INTO outbox_network_failure (message_id, recipient_id)
                    VALUES (?, ?)",
                )
                .bind(id)
                .bind(recipient)
                .execute(txn.as_mut())
                .await?;
            }
            Ok(())
        }

        pub(crate) async fn identity_mismatches(
            executor: impl SqliteExecutor<'_>,
            id: OutboxMessageId,
        ) -> sqlx::Result<HashMap<RecipientId, Vec<u8>>> {
            #[derive(FromRow)]
            struct Row {
                recipient_id: RecipientId,
                identity_key: Vec<u8>,
            }
            let rows: Vec<Row> = sqlx::query_as(
                "SELECT recipient_id, identity_key
                FROM outbox_identity_mismatch
                WHERE message_id = ?",
            )
            .bind(id)
            .fetch_all(executor)
            .await?;
            Ok(rows
                .into_iter()
                .map(|row| (row.recipient_id, row.identity_key))
                .collect())
        }

        pub(crate) async fn replace_identity_mismatches(
            txn: &mut SqliteTransaction<'_>,
            id: OutboxMessageId,
            mismatches: &HashMap<RecipientId, Vec<u8>>,
        ) -> sqlx::Result<()> {
            query("DELETE FROM outbox_identity_mismatch WHERE message_id = ?")
                .bind(id)
                .execute(txn.as_mut())
                .await?;
            for (recipient, identity_key) in mismatches {
                query(
                    "INSERT INTO outbox_identity_mismatch
                        (message_id, recipient_id, identity_key)
                    VALUES (?, ?, ?)",
                )
                .bind(id)
                .bind(recipient)
                .bind(identity_key)
                .execute(txn.as_mut())
                .await?;
            }
            Ok(())
        }

        /// Removes a recorded identity mismatch after the user re-verified
        /// the recipient's new key.
        pub(crate) async fn resolve_identity_mismatch(
            executor: impl SqliteExecutor<'_>,
            id: OutboxMessageId,
            recipient: RecipientId,
        ) -> sqlx::Result<()> {
            query(
                "DELETE FROM outbox_identity_mismatch
                WHERE message_id = ? AND recipient_id = ?",
            )
            .bind(id)
            .bind(recipient)
            .execute(executor)
            .await?;
            Ok(())
        }

        pub(crate) async fn skipped_ledger(
            executor: impl SqliteExecutor<'_>,
            id: OutboxMessageId,
        ) -> sqlx::Result<HashSet<RecipientId>> {
            let recipients: Vec<RecipientId> =
                query_scalar("SELECT recipient_id FROM outbox_skipped WHERE message_id = ?")
                    .bind(id)
                    .fetch_all(executor)
                    .await?;
            Ok(recipients.into_iter().collect())
        }

        pub(crate) async fn add_skipped(
            txn: &mut SqliteTransaction<'_>,
            id: OutboxMessageId,
            skipped: &HashSet<RecipientId>,
        ) -> sqlx::Result<()> {
            for recipient in skipped {
                query(
                    "INSERT INTO outbox_skipped (message_id, recipient_id)
                    VALUES (?, ?)
                    ON CONFLICT DO NOTHING",
                )
                .bind(id)
                .bind(recipient)
                .execute(txn.as_mut())
                .await?;
            }
            Ok(())
        }
    }
}

impl SendState {
    fn as_str(&self) -> &'static str {
        match self {
            SendState::Pending => "pending",
            SendState::Sending => "sending",
            SendState::Sent => "sent",
            SendState::Failed => "failed",
        }
    }
}

impl Type<Sqlite> for SendState {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'r> Decode<'r, Sqlite> for SendState {
    fn decode(value: <Sqlite as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let s: &str = Decode::<Sqlite>::decode(value)?;
        match s {
            "pending" => Ok(SendState::Pending),
            "sending" => Ok(SendState::Sending),
            "sent" => Ok(SendState::Sent),
            "failed" => Ok(SendState::Failed),
            _ => Err(format!("Unknown SendState variant: {s}").into()),
        }
    }
}

impl<'q> Encode<'q, Sqlite> for SendState {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        <&str as Encode<Sqlite>>::encode(self.as_str(), buf)
    }
}
