// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use serde::Deserialize;

use crate::scheduler::backoff::RetryPolicy;

/// Tunables of the scheduler core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of jobs that may run concurrently.
    pub worker_slots: usize,
    /// First retry delay in milliseconds.
    pub base_backoff_ms: u64,
    /// Upper bound on the retry delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Delay applied to rate-limited jobs when the server did not specify one.
    pub rate_limit_backoff_ms: u64,
    /// Chunk size for resumable uploads.
    pub upload_chunk_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_slots: 4,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            rate_limit_backoff_ms: 60_000,
            upload_chunk_size: 64 * 1024,
        }
    }
}

impl SchedulerConfig {
    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub(crate) fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }
}
