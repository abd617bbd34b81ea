// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable store setup: pool opening and embedded schema migrations.

use std::path::Path;

use sqlx::{
    SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::debug;

static MIGRATOR: Migrator = sqlx::migrate!();

/// Opens (or creates) the client database at `path` and applies pending
/// schema migrations.
pub async fn open_client_db(path: impl AsRef<Path>) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    MIGRATOR.run(&pool).await?;
    debug!(path = %path.as_ref().display(), "opened client database");
    Ok(pool)
}

#[cfg(test)]
pub(crate) mod testing {
    use tempfile::TempDir;

    use super::*;

    /// A migrated on-disk database which lives as long as the returned guard.
    pub(crate) async fn open_test_db() -> (SqlitePool, TempDir) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let pool = open_client_db(dir.path().join("client.sqlite"))
            .await
            .expect("failed to open test database");
        (pool, dir)
    }
}
