// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The durable unit of work and its polymorphic execution contract.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{
    capability::{Clock, CryptoCapability, NetworkCapability},
    config::SchedulerConfig,
    events::EventSink,
    identifiers::JobId,
};

/// Schema version written to newly enqueued job payloads.
pub const JOB_SCHEMA_VERSION: i64 = 1;

/// Outcome of a single job attempt.
#[derive(Debug)]
pub enum JobOutcome {
    /// The job completed; its record is removed and dependents re-evaluated.
    Success,
    /// Transient failure; re-run after backoff (at least `delay` if given).
    Retry { delay: Option<Duration> },
    /// The server asked us to back off; does not count as an attempt.
    RateLimited { retry_after: Option<Duration> },
    /// Permanent failure; dependents are cascaded to permanent failure.
    Failure(anyhow::Error),
}

impl JobOutcome {
    pub fn retry() -> Self {
        Self::Retry { delay: None }
    }

    pub fn retry_after(delay: Duration) -> Self {
        Self::Retry { delay: Some(delay) }
    }

    pub fn failure(error: impl Into<anyhow::Error>) -> Self {
        Self::Failure(error.into())
    }
}

/// Everything a job sees while running.
///
/// Capabilities are abstract so that jobs never touch the wire client or the
/// cryptographic protocol directly.
#[derive(Clone)]
pub struct JobContext {
    pub pool: SqlitePool,
    pub network: Arc<dyn NetworkCapability>,
    pub crypto: Arc<dyn CryptoCapability>,
    pub clock: Arc<dyn Clock>,
    pub events: EventSink,
    pub process_state: Arc<ProcessState>,
    pub config: SchedulerConfig,
}

/// Process-scoped state with a lifecycle tied to scheduler startup.
///
/// Replaces the static "has refreshed this cycle" flags of attribute-refresh
/// style jobs; reset whenever the scheduler is started.
#[derive(Debug, Default)]
pub struct ProcessState {
    attributes_refreshed: AtomicBool,
}

impl ProcessState {
    pub fn attributes_refreshed(&self) -> bool {
        self.attributes_refreshed.load(Ordering::SeqCst)
    }

    pub fn mark_attributes_refreshed(&self) {
        self.attributes_refreshed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.attributes_refreshed.store(false, Ordering::SeqCst);
    }
}

/// A job type's execution logic.
///
/// Implementations are constructed from a persisted payload by the factory
/// registered under their key.
#[async_trait]
pub trait Executable: Send {
    async fn run(&mut self, ctx: &JobContext) -> JobOutcome;

    /// Invoked when the job reaches permanent failure, including cascade
    /// failures where `run` was never called.
    async fn on_failure(&mut self, _ctx: &JobContext) {}
}

type Factory = Box<dyn Fn(&[u8]) -> anyhow::Result<Box<dyn Executable>> + Send + Sync>;

/// Maps factory keys to deserialization/execution logic.
#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<&'static str, Factory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        factory_key: &'static str,
        factory: impl Fn(&[u8]) -> anyhow::Result<Box<dyn Executable>> + Send + Sync + 'static,
    ) {
        self.factories.insert(factory_key, Box::new(factory));
    }

    pub(crate) fn create(
        &self,
        factory_key: &str,
        payload: &[u8],
    ) -> anyhow::Result<Box<dyn Executable>> {
        let factory = self
            .factories
            .get(factory_key)
            .ok_or_else(|| anyhow::anyhow!("no job factory registered for key {factory_key:?}"))?;
        factory(payload)
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub factory_key: &'static str,
    pub queue_key: Option<String>,
    pub payload: Vec<u8>,
    pub constraint_keys: Vec<String>,
    pub depends_on: Vec<JobId>,
    pub lifespan: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(factory_key: &'static str, payload: Vec<u8>) -> Self {
        Self {
            id: JobId::random(),
            factory_key,
            queue_key: None,
            payload,
            constraint_keys: Vec::new(),
            depends_on: Vec::new(),
            lifespan: None,
            max_attempts: None,
        }
    }

    pub fn with_queue_key(mut self, queue_key: impl Into<String>) -> Self {
        self.queue_key = Some(queue_key.into());
        self
    }

    pub fn with_constraint(mut self, key: impl Into<String>) -> Self {
        self.constraint_keys.push(key.into());
        self
    }

    pub fn depends_on(mut self, id: JobId) -> Self {
        self.depends_on.push(id);
        self
    }

    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = Some(lifespan);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Persisted state of a job record.
///
/// Running is an in-memory notion; a crash mid-run leaves the record pending
/// so that the job is re-dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    /// Permanent-failure tombstone; kept so that later enqueues naming this
    /// job as a dependency fail fast.
    Failed,
}

/// A persisted job record.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub factory_key: String,
    pub queue_key: Option<String>,
    pub payload: Vec<u8>,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub lifespan_ms: Option<i64>,
    pub max_attempts: Option<i64>,
    pub current_attempt: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub schema_version: i64,
    pub constraint_keys: Vec<String>,
    pub state: JobState,
    /// Some dependency is still pending.
    pub blocked: bool,
    /// Some dependency failed permanently.
    pub dependency_failed: bool,
}

impl JobRecord {
    pub(crate) fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.lifespan_ms
            .map(|ms| self.created_at + chrono::Duration::milliseconds(ms))
    }

    pub(crate) fn lifespan_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|deadline| now >= deadline)
    }
}
