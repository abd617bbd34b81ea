// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Payload schema migrations for persisted job records.
//!
//! Before a record written by an older version of the application is first
//! executed, the chain upgrades its payload one version at a time. Migrations
//! are pure payload transforms; the escape valve for legacy cases is the
//! `extra_jobs` field, which lets a migration enqueue compensating jobs.

use std::collections::BTreeMap;

use super::job::NewJob;

/// Result of applying one migration step.
pub struct MigrationOutput {
    pub payload: Vec<u8>,
    pub extra_jobs: Vec<NewJob>,
}

impl MigrationOutput {
    pub fn payload(payload: Vec<u8>) -> Self {
        Self {
            payload,
            extra_jobs: Vec::new(),
        }
    }
}

/// A single payload transform.
///
/// `end_version` is the schema version a payload has after the transform;
/// the chain applies transforms for versions `record + 1 ..= current` in
/// ascending order. Transforms must be idempotent on their own output.
pub trait PayloadMigration: Send + Sync {
    fn end_version(&self) -> i64;

    fn apply(&self, factory_key: &str, payload: Vec<u8>) -> anyhow::Result<MigrationOutput>;
}

pub struct MigrationChain {
    current_version: i64,
    migrations: BTreeMap<i64, Box<dyn PayloadMigration>>,
}

impl MigrationChain {
    pub fn new(current_version: i64) -> Self {
        Self {
            current_version,
            migrations: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, migration: impl PayloadMigration + 'static) {
        debug_assert!(migration.end_version() <= self.current_version);
        self.migrations
            .insert(migration.end_version(), Box::new(migration));
    }

    pub fn current_version(&self) -> i64 {
        self.current_version
    }

    /// Upgrades `payload` from `schema_version` to the current version.
    ///
    /// A no-op (identical payload, no extra jobs) when the record is already
    /// current.
    pub fn migrate(
        &self,
        schema_version: i64,
        factory_key: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<MigrationOutput> {
        let mut output = MigrationOutput::payload(payload);
        if schema_version >= self.current_version {
            return Ok(output);
        }
        for (version, migration) in self
            .migrations
            .range(schema_version + 1..=self.current_version)
        {
            let step = migration.apply(factory_key, output.payload)?;
            output.payload = step.payload;
            output.extra_jobs.extend(step.extra_jobs);
            tracing::debug!(%version, factory_key, "migrated job payload");
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AppendMarker {
        end_version: i64,
        marker: &'static [u8],
    }

    impl PayloadMigration for AppendMarker {
        fn end_version(&self) -> i64 {
            self.end_version
        }

        fn apply(&self, _factory_key: &str, mut payload: Vec<u8>) -> anyhow::Result<MigrationOutput> {
            payload.extend_from_slice(self.marker);
            Ok(MigrationOutput::payload(payload))
        }
    }

    fn chain() -> MigrationChain {
        let mut chain = MigrationChain::new(3);
        chain.register(AppendMarker {
            end_version: 2,
            marker: b"+v2",
        });
        chain.register(AppendMarker {
            end_version: 3,
            marker: b"+v3",
        });
        chain
    }

    #[test]
    fn applies_steps_in_ascending_order() {
        let output = chain().migrate(1, "test", b"v1".to_vec()).unwrap();
        assert_eq!(output.payload, b"v1+v2+v3");
    }

    #[test]
    fn partial_upgrade_starts_at_the_right_step() {
        let output = chain().migrate(2, "test", b"v2".to_vec()).unwrap();
        assert_eq!(output.payload, b"v2+v3");
    }

    #[test]
    fn current_version_is_a_noop() {
        let output = chain().migrate(3, "test", b"current".to_vec()).unwrap();
        assert_eq!(output.payload, b"current");
        assert!(output.extra_jobs.is_empty());
    }
}
