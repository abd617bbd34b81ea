// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Content-addressed attachment records and their processing state machine.
//!
//! An attachment progresses pending → compressed → uploading → uploaded.
//! Records are keyed by the SHA-256 of the plaintext, so the same content
//! attached to several messages is processed once; messages reference the
//! record through a link table.

use chrono::{DateTime, Utc};
use sqlx::{
    Database, Decode, Encode, Sqlite, Type, encode::IsNull, error::BoxDynError,
    sqlite::SqliteTypeInfo,
};

use crate::identifiers::{AttachmentId, OutboxMessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentStatus {
    /// Plaintext captured, not yet compressed.
    Pending,
    /// Compressed bytes available, no upload location yet.
    Compressed,
    /// Upload location provisioned; bytes partially transferred.
    Uploading,
    /// Upload complete and digest-verified.
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttachmentRecord {
    pub id: AttachmentId,
    pub status: AttachmentStatus,
    pub plaintext: Option<Vec<u8>>,
    pub compressed: Option<Vec<u8>>,
    pub upload_location: Option<String>,
    pub digest: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl AttachmentRecord {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            id: AttachmentId::for_content(&content),
            status: AttachmentStatus::Pending,
            plaintext: Some(content),
            compressed: None,
            upload_location: None,
            digest: None,
            created_at: Utc::now(),
        }
    }
}

mod persistence {
    use sqlx::{SqliteExecutor, query, query_scalar};

    use super::*;

    impl AttachmentRecord {
        /// Persists the record unless the same content is already known.
        ///
        /// Returns whether a new record was inserted.
        pub(crate) async fn store_if_new(
            &self,
            executor: impl SqliteExecutor<'_>,
        ) -> sqlx::Result<bool> {
            let result = query(
                "INSERT INTO outbox_attachment
                    (id, status, plaintext, compressed, upload_location, digest, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT DO NOTHING",
            )
            .bind(&self.id)
            .bind(self.status)
            .bind(&self.plaintext)
            .bind(&self.compressed)
            .bind(&self.upload_location)
            .bind(&self.digest)
            .bind(self.created_at)
            .execute(executor)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            id: &AttachmentId,
        ) -> sqlx::Result<Option<Self>> {
            sqlx::query_as(
                "SELECT id, status, plaintext, compressed, upload_location, digest, created_at
                FROM outbox_attachment
                WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(executor)
            .await
        }

        pub(crate) async fn link_to_message(
            executor: impl SqliteExecutor<'_>,
            message_id: OutboxMessageId,
            id: &AttachmentId,
        ) -> sqlx::Result<()> {
            query(
                "INSERT INTO outbox_message_attachment (message_id, attachment_id)
                VALUES (?, ?)
                ON CONFLICT DO NOTHING",
            )
            .bind(message_id)
            .bind(id)
            .execute(executor)
            .await?;
            Ok(())
        }

        /// Uploaded attachment locations of a message, for envelope assembly.
        pub(crate) async fn uploaded_locations_for_message(
            executor: impl SqliteExecutor<'_>,
            message_id: OutboxMessageId,
        ) -> sqlx::Result<Vec<String>> {
            query_scalar(
                "SELECT a.upload_location FROM outbox_attachment a
                JOIN outbox_message_attachment ma ON ma.attachment_id = a.id
                WHERE ma.message_id = ? AND a.status = 'uploaded'",
            )
            .bind(message_id)
            .fetch_all(executor)
            .await
        }

        pub(crate) async fn set_compressed(
            executor: impl SqliteExecutor<'_>,
            id: &AttachmentId,
            compressed: &[u8],
        ) -> sqlx::Result<()> {
            query(
                "UPDATE outbox_attachment
                SET status = 'compressed', compressed = ?, plaintext = NULL
                WHERE id = ?",
            )
            .bind(compressed)
            .bind(id)
            .execute(executor)
            .await?;
            Ok(())
        }

        /// Persists the provisioned upload location before the first byte is
        /// transferred, so a crash mid-upload resumes at the same location.
        pub(crate) async fn set_upload_location(
            executor: impl SqliteExecutor<'_>,
            id: &AttachmentId,
            location: &str,
        ) -> sqlx::Result<()> {
            query(
                "UPDATE outbox_attachment
                SET status = 'uploading', upload_location = ?
                WHERE id = ?",
            )
            .bind(location)
            .bind(id)
            .execute(executor)
            .await?;
            Ok(())
        }

        pub(crate) async fn mark_uploaded(
            executor: impl SqliteExecutor<'_>,
            id: &AttachmentId,
            digest: &[u8],
        ) -> sqlx::Result<()> {
            query(
                "UPDATE outbox_attachment
                SET status = 'uploaded', digest = ?, compressed = NULL
                WHERE id = ?",
            )
            .bind(digest)
            .bind(id)
            .execute(executor)
            .await?;
            Ok(())
        }

        pub(crate) async fn mark_failed(
            executor: impl SqliteExecutor<'_>,
            id: &AttachmentId,
        ) -> sqlx::Result<()> {
            query("UPDATE outbox_attachment SET status = 'failed' WHERE id = ?")
                .bind(id)
                .execute(executor)
                .await?;
            Ok(())
        }
    }
}

impl AttachmentStatus {
    fn as_str(&self) -> &'static str {
        match self {
            AttachmentStatus::Pending => "pending",
            AttachmentStatus::Compressed => "compressed",
            AttachmentStatus::Uploading => "uploading",
            AttachmentStatus::Uploaded => "uploaded",
            AttachmentStatus::Failed => "failed",
        }
    }
}

impl Type<Sqlite> for AttachmentStatus {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'r> Decode<'r, Sqlite> for AttachmentStatus {
    fn decode(value: <Sqlite as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let s: &str = Decode::<Sqlite>::decode(value)?;
        match s {
            "pending" => Ok(AttachmentStatus::Pending),
            "compressed" => Ok(AttachmentStatus::Compressed),
            "uploading" => Ok(AttachmentStatus::Uploading),
            "uploaded" => Ok(AttachmentStatus::Uploaded),
            "failed" => Ok(AttachmentStatus::Failed),
            _ => Err(format!("Unknown AttachmentStatus variant: {s}").into()),
        }
    }
}

impl<'q> Encode<'q, Sqlite> for AttachmentStatus {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        <&str as Encode<Sqlite>>::encode(self.as_str(), buf)
    }
}
