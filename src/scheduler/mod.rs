// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The durable job scheduling engine.
//!
//! The scheduler persists job records, walks the dependency graph and the
//! constraint set to compute the currently-runnable set, enforces per-queue
//! serialization, dispatches runnable jobs to a bounded worker pool and
//! applies each job's retry/backoff/failure policy to its outcome.
//!
//! The service itself is a background task driven by a [`tokio::sync::watch`]
//! cell holding a [`RunToken`]. The initial state is `Stopped`; the task only
//! does work when started or notified, and goes back to waiting after a full
//! dispatch pass.

use std::{
    collections::{HashMap, HashSet},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use pin_project::pin_project;
use sqlx::SqlitePool;
use tokio::{
    sync::watch,
    task::JoinSet,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, warn};

use crate::{
    capability::{Clock, CryptoCapability, NetworkCapability},
    config::SchedulerConfig,
    constraints::ConstraintRegistry,
    events::{EventSink, OutboundEvent},
    identifiers::JobId,
    utils::connection_ext::StoreExt,
};

pub mod backoff;
pub mod job;
pub mod migrations;
mod persistence;

use job::{JobContext, JobOutcome, JobRecord, JobRegistry, NewJob, ProcessState};
use migrations::MigrationChain;

/// The durable job scheduler.
///
/// Generic over the work implementation so that the service lifecycle can be
/// tested in isolation.
#[derive(Debug)]
pub struct JobScheduler<C: SchedulerWork = SchedulerContext> {
    context: C,
    run_token_tx: Arc<watch::Sender<RunToken>>,
}

pub trait SchedulerWork: Clone + Send + 'static {
    fn work(&self, run_token: CancellationToken) -> impl Future<Output = ()> + Send;
}

impl SchedulerWork for SchedulerContext {
    async fn work(&self, run_token: CancellationToken) {
        SchedulerContext::work(self, run_token).await;
    }
}

/// A clonable hook for waking the dispatch loop.
///
/// Held by constraint observers and the send orchestrator; never runs jobs
/// itself, only triggers re-evaluation.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    run_token_tx: Arc<watch::Sender<RunToken>>,
}

impl SchedulerHandle {
    /// Notifies the background task about new work.
    pub fn notify_work(&self) -> WaitForDoneFuture {
        let mut done_token = None;
        let notified = self.run_token_tx.send_if_modified(|run_token| {
            if run_token.is_cancelled() {
                false
            } else {
                run_token.rotate_done();
                done_token = Some(run_token.done.clone());
                true
            }
        });
        debug!(?notified, "notifying scheduler about new work");
        WaitForDoneFuture::new(done_token)
    }
}

impl JobScheduler<SchedulerContext> {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        registry: JobRegistry,
        migrations: MigrationChain,
        constraints: ConstraintRegistry,
        config: SchedulerConfig,
        network: Arc<dyn NetworkCapability>,
        crypto: Arc<dyn CryptoCapability>,
        clock: Arc<dyn Clock>,
        events: EventSink,
    ) -> Self {
        let (run_token_tx, run_token_rx) = watch::channel(RunToken::new_cancelled());
        let run_token_tx = Arc::new(run_token_tx);
        let process_state = Arc::new(ProcessState::default());
        // Process-scoped state starts a fresh cycle with the scheduler.
        process_state.reset();
        let context = SchedulerContext {
            pool,
            registry: Arc::new(registry),
            migrations: Arc::new(migrations),
            constraints: Arc::new(constraints),
            config,
            network,
            crypto,
            clock,
            events,
            process_state,
            running: Arc::new(Mutex::new(RunningSet::default())),
            handle: SchedulerHandle {
                run_token_tx: run_token_tx.clone(),
            },
        };
        let task = SchedulerTask {
            context: context.clone(),
        };
        tokio::spawn(task.run(run_token_rx));
        Self {
            context,
            run_token_tx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.context.handle.clone()
    }

    pub fn events(&self) -> &EventSink {
        &self.context.events
    }

    /// Persists a single job and wakes the dispatch loop.
    pub async fn enqueue(&self, job: NewJob) -> anyhow::Result<JobId> {
        let mut ids = self.enqueue_batch(vec![job]).await?;
        Ok(ids.pop().expect("one job was enqueued"))
    }

    /// Persists a batch of jobs atomically and wakes the dispatch loop.
    ///
    /// Either the whole batch is wired and enqueued or none of it is. Jobs
    /// depending on an already failed job are persisted as failed without
    /// ever running (fail-fast propagation).
    pub async fn enqueue_batch(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<JobId>> {
        let context = &self.context;
        let now = context.clock.now();
        let version = context.migrations.current_version();
        let mut failed_fast = Vec::new();
        context
            .pool
            .with_transaction(async |txn| {
                for job in &jobs {
                    if JobRecord::insert(txn, job, now, version).await? {
                        failed_fast.push(job.clone());
                    }
                }
                Ok(())
            })
            .await?;
        let ctx = context.job_context();
        for job in &failed_fast {
            warn!(id = %job.id, factory_key = job.factory_key,
                "dependency already failed; job enqueued as failed");
            match context.registry.create(job.factory_key, &job.payload) {
                Ok(mut executable) => executable.on_failure(&ctx).await,
                Err(error) => {
                    error!(%error, id = %job.id, "no failure callback for failed job")
                }
            }
            context.events.emit(OutboundEvent::JobFailed {
                job_id: job.id,
                factory_key: job.factory_key.to_owned(),
            });
        }
        self.notify_work();
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    /// Enqueues jobs as a chain: each job depends on its predecessor.
    pub async fn enqueue_chain(&self, mut jobs: Vec<NewJob>) -> anyhow::Result<Vec<JobId>> {
        let mut previous: Option<JobId> = None;
        for job in &mut jobs {
            if let Some(previous) = previous {
                job.depends_on.push(previous);
            }
            previous = Some(job.id);
        }
        self.enqueue_batch(jobs).await
    }

    /// Removes all not-yet-started jobs sharing the queue key.
    ///
    /// Already-running jobs hold a dispatch claim on their record and
    /// complete normally. Dependents of a cancelled job are cascaded to
    /// permanent failure.
    pub async fn cancel_queue(&self, queue_key: &str) -> anyhow::Result<u64> {
        let cancelled = self
            .context
            .pool
            .with_transaction(async |txn| {
                let ids = JobRecord::cancellable_in_queue(txn.as_mut(), queue_key).await?;
                let mut cancelled = 0u64;
                for id in ids {
                    let dependents = collect_pending_dependents(txn, id).await?;
                    for dependent in &dependents {
                        JobRecord::mark_failed(txn.as_mut(), dependent.id).await?;
                    }
                    JobRecord::delete(txn.as_mut(), id).await?;
                    cancelled += 1;
                }
                Ok(cancelled)
            })
            .await?;
        debug!(queue_key, cancelled, "cancelled queue");
        Ok(cancelled)
    }

    /// Deletes failed tombstone records.
    pub async fn purge_tombstones(&self) -> anyhow::Result<u64> {
        Ok(JobRecord::purge_tombstones(&self.context.pool).await?)
    }

    /// Drains in-flight jobs and refuses new dispatch.
    ///
    /// Returns `false` when the drain did not finish within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.stop()).await.is_ok()
    }
}

impl<C: SchedulerWork> JobScheduler<C> {
    fn with_context(context: C) -> Self {
        let (run_token_tx, run_token_rx) = watch::channel(RunToken::new_cancelled());
        let task = SchedulerTask {
            context: context.clone(),
        };
        tokio::spawn(task.run(run_token_rx));
        Self {
            context,
            run_token_tx: Arc::new(run_token_tx),
        }
    }

    /// Starts the background task.
    ///
    /// Returns a future which finishes when the current dispatch pass is done.
    pub fn start(&self) -> WaitForDoneFuture {
        let mut done_token = None;
        self.run_token_tx.send_if_modified(|run_token| {
            if !run_token.rotate() {
                run_token.rotate_done();
            }
            done_token = Some(run_token.done.clone());
            true // notify the background task
        });
        debug!("starting scheduler");
        WaitForDoneFuture::new(done_token)
    }

    /// Notifies the background task to stop.
    ///
    /// Returns a future which resolves when the background task fully stops.
    pub fn stop(&self) -> WaitForDoneFuture {
        let mut done_token = None;
        self.run_token_tx.send_if_modified(|run_token| {
            run_token.cancel();
            done_token = Some(run_token.done.clone());
            false // no more work => no need to wake up the background task
        });
        debug!("stopping scheduler");
        WaitForDoneFuture::new(done_token)
    }

    /// Notifies the background task about new work.
    pub fn notify_work(&self) -> WaitForDoneFuture {
        let mut done_token = None;
        let notified = self.run_token_tx.send_if_modified(|run_token| {
            if run_token.is_cancelled() {
                false
            } else {
                run_token.rotate_done();
                done_token = Some(run_token.done.clone());
                true
            }
        });
        debug!(?notified, "notifying scheduler about new work");
        WaitForDoneFuture::new(done_token)
    }

    /// Runs a full dispatch pass and waits until it is done.
    ///
    /// The scheduler is stopped afterwards in any case.
    pub async fn run_once(&self) {
        self.start().await;
        self.stop().await;
    }
}

struct SchedulerTask<C> {
    context: C,
}

impl<C: SchedulerWork> SchedulerTask<C> {
    async fn run(self, mut run_token_rx: watch::Receiver<RunToken>) {
        loop {
            if run_token_rx.changed().await.is_err() {
                break;
            }

            let run_token = {
                let run_token = run_token_rx.borrow_and_update().clone();
                debug!(?run_token, "incoming work notification");

                if run_token.is_cancelled() {
                    run_token.mark_as_done();
                    continue;
                }

                run_token
            };

            debug!("starting dispatch pass");
            self.context.work(run_token.cancel.clone()).await;
            debug!("finished dispatch pass");

            run_token.mark_as_done();
        }
    }
}

/// In-flight bookkeeping of the dispatch loop: queue serialization and the
/// task-id to job mapping for panic handling.
#[derive(Debug, Default)]
struct RunningSet {
    by_task: HashMap<tokio::task::Id, (JobId, Option<String>)>,
    job_ids: HashSet<JobId>,
    queues: HashSet<String>,
}

impl RunningSet {
    fn insert(&mut self, task_id: tokio::task::Id, record: &JobRecord) {
        self.by_task
            .insert(task_id, (record.id, record.queue_key.clone()));
        self.job_ids.insert(record.id);
        if let Some(queue_key) = &record.queue_key {
            self.queues.insert(queue_key.clone());
        }
    }

    fn remove(&mut self, task_id: tokio::task::Id) -> Option<(JobId, Option<String>)> {
        let (job_id, queue_key) = self.by_task.remove(&task_id)?;
        self.job_ids.remove(&job_id);
        if let Some(queue_key) = &queue_key {
            self.queues.remove(queue_key);
        }
        Some((job_id, queue_key))
    }
}

#[derive(Clone)]
pub struct SchedulerContext {
    pool: SqlitePool,
    registry: Arc<JobRegistry>,
    migrations: Arc<MigrationChain>,
    constraints: Arc<ConstraintRegistry>,
    config: SchedulerConfig,
    network: Arc<dyn NetworkCapability>,
    crypto: Arc<dyn CryptoCapability>,
    clock: Arc<dyn Clock>,
    events: EventSink,
    process_state: Arc<ProcessState>,
    running: Arc<Mutex<RunningSet>>,
    handle: SchedulerHandle,
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext").finish_non_exhaustive()
    }
}

impl SchedulerContext {
    fn job_context(&self) -> JobContext {
        JobContext {
            pool: self.pool.clone(),
            network: self.network.clone(),
            crypto: self.crypto.clone(),
            clock: self.clock.clone(),
            events: self.events.clone(),
            process_state: self.process_state.clone(),
            config: self.config.clone(),
        }
    }

    /// One dispatch pass: fills worker slots with runnable jobs and applies
    /// outcomes until neither running nor runnable jobs remain.
    async fn work(&self, run_token: CancellationToken) {
        // No job is in flight between passes; claims still present belong to
        // an interrupted pass or a previous process.
        if let Err(error) = JobRecord::release_claims(&self.pool).await {
            error!(%error, "failed to release stale dispatch claims");
        }
        let pass_claim = uuid::Uuid::new_v4();
        let mut join_set: JoinSet<(JobRecord, JobOutcome)> = JoinSet::new();
        loop {
            if !run_token.is_cancelled() {
                match self.select_runnable().await {
                    Ok(runnable) => {
                        for record in runnable {
                            if join_set.len() >= self.config.worker_slots {
                                break;
                            }
                            // Cancelled since selection, or already claimed.
                            match JobRecord::claim(&self.pool, record.id, pass_claim).await {
                                Ok(true) => {}
                                Ok(false) => continue,
                                Err(error) => {
                                    error!(%error, id = %record.id, "failed to claim job");
                                    continue;
                                }
                            }
                            let task = run_job(
                                record.clone(),
                                self.registry.clone(),
                                self.migrations.clone(),
                                self.job_context(),
                            );
                            let handle = join_set.spawn(task);
                            self.running
                                .lock()
                                .expect("poisoned running set lock")
                                .insert(handle.id(), &record);
                        }
                    }
                    Err(error) => {
                        error!(%error, "failed to select runnable jobs");
                    }
                }
            }

            if join_set.is_empty() {
                break;
            }

            match join_set.join_next_with_id().await {
                Some(Ok((task_id, (record, outcome)))) => {
                    self.running
                        .lock()
                        .expect("poisoned running set lock")
                        .remove(task_id);
                    if let Err(error) = self.apply_outcome(&record, outcome).await {
                        error!(%error, id = %record.id, "failed to apply job outcome");
                    }
                }
                Some(Err(join_error)) => {
                    let task_id = join_error.id();
                    let removed = self
                        .running
                        .lock()
                        .expect("poisoned running set lock")
                        .remove(task_id);
                    if let Some((job_id, _)) = removed {
                        error!(%join_error, id = %job_id, "job task panicked");
                        if let Err(error) = self.fail_job_by_id(job_id).await {
                            error!(%error, id = %job_id, "failed to fail panicked job");
                        }
                    }
                }
                None => break,
            }
        }

        if let Err(error) = self.arm_wakeup_timer().await {
            error!(%error, "failed to arm wake-up timer");
        }
    }

    /// Computes the currently-runnable set.
    ///
    /// Pending records are walked in submission order. Per queue key only the
    /// head is considered; a blocked head blocks the whole queue for this
    /// pass, which keeps execution FIFO per queue. Jobs whose dependency
    /// failed or whose lifespan expired are failed permanently here.
    async fn select_runnable(&self) -> anyhow::Result<Vec<JobRecord>> {
        let records = JobRecord::load_pending(&self.pool).await?;
        let now = self.clock.now();
        let (running_jobs, running_queues) = {
            let running = self.running.lock().expect("poisoned running set lock");
            (running.job_ids.clone(), running.queues.clone())
        };

        let mut seen_queues = HashSet::new();
        let mut runnable = Vec::new();
        for record in records {
            if running_jobs.contains(&record.id) {
                continue;
            }
            if let Some(queue_key) = &record.queue_key {
                if running_queues.contains(queue_key) {
                    continue;
                }
                if !seen_queues.insert(queue_key.clone()) {
                    // Not the head of its queue.
                    continue;
                }
            }
            if record.dependency_failed {
                warn!(id = %record.id, "dependency failed permanently; cascading");
                self.fail_job(&record).await?;
                continue;
            }
            if record.lifespan_expired(now) {
                warn!(id = %record.id, "job lifespan expired; failing permanently");
                self.fail_job(&record).await?;
                continue;
            }
            if record.blocked {
                continue;
            }
            if record.next_attempt_at > now {
                continue;
            }
            // Constraint gating failure is not an error: the job simply stays
            // pending with no attempt increment and no backoff.
            if !self.constraints.are_met(&record.constraint_keys) {
                continue;
            }
            runnable.push(record);
        }
        Ok(runnable)
    }

    async fn apply_outcome(&self, record: &JobRecord, outcome: JobOutcome) -> anyhow::Result<()> {
        match outcome {
            JobOutcome::Success => {
                debug!(id = %record.id, factory_key = %record.factory_key, "job succeeded");
                JobRecord::delete(&self.pool, record.id).await?;
            }
            JobOutcome::Retry { delay } => {
                let attempt = record.current_attempt + 1;
                let now = self.clock.now();
                let backoff = self.config.retry_policy().backoff(attempt as u32);
                let delay = delay.map_or(backoff, |floor| floor.max(backoff));
                let next_attempt_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);

                let attempts_exhausted = record
                    .max_attempts
                    .is_some_and(|max_attempts| attempt >= max_attempts);
                let lifespan_exhausted = record
                    .expires_at()
                    .is_some_and(|deadline| next_attempt_at >= deadline);
                if attempts_exhausted || lifespan_exhausted {
                    warn!(
                        id = %record.id, attempt, attempts_exhausted, lifespan_exhausted,
                        "retries exhausted; failing permanently"
                    );
                    self.fail_job(record).await?;
                } else {
                    debug!(id = %record.id, attempt, ?delay, "job will be retried");
                    JobRecord::record_attempt(&self.pool, record.id, attempt, next_attempt_at)
                        .await?;
                }
            }
            JobOutcome::RateLimited { retry_after } => {
                let delay = retry_after.unwrap_or_else(|| self.config.rate_limit_backoff());
                let next_attempt_at =
                    self.clock.now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                debug!(id = %record.id, ?delay, "job rate-limited; attempt not counted");
                JobRecord::reschedule(&self.pool, record.id, next_attempt_at).await?;
            }
            JobOutcome::Failure(error) => {
                error!(%error, id = %record.id, factory_key = %record.factory_key, "job failed permanently");
                self.fail_job(record).await?;
            }
        }
        Ok(())
    }

    async fn fail_job_by_id(&self, id: JobId) -> anyhow::Result<()> {
        let Some(record) = JobRecord::load(&self.pool, id).await? else {
            return Ok(());
        };
        self.fail_job(&record).await
    }

    /// Marks the job and all of its transitive pending dependents as failed,
    /// then invokes their failure callbacks and emits events.
    async fn fail_job(&self, record: &JobRecord) -> anyhow::Result<()> {
        let mut failed = vec![record.clone()];
        self.pool
            .with_transaction(async |txn| {
                let dependents = collect_pending_dependents(txn, record.id).await?;
                JobRecord::mark_failed(txn.as_mut(), record.id).await?;
                for dependent in &dependents {
                    JobRecord::mark_failed(txn.as_mut(), dependent.id).await?;
                }
                failed.extend(dependents);
                Ok(())
            })
            .await?;

        let ctx = self.job_context();
        for record in &failed {
            match self.registry.create(&record.factory_key, &record.payload) {
                Ok(mut executable) => executable.on_failure(&ctx).await,
                Err(error) => {
                    error!(%error, id = %record.id, "no failure callback for failed job")
                }
            }
            self.events.emit(OutboundEvent::JobFailed {
                job_id: record.id,
                factory_key: record.factory_key.clone(),
            });
        }
        Ok(())
    }

    /// Re-notifies the service when the earliest pending attempt becomes due.
    async fn arm_wakeup_timer(&self) -> anyhow::Result<()> {
        let records = JobRecord::load_pending(&self.pool).await?;
        let now = self.clock.now();
        let Some(wake_at) = records
            .iter()
            .map(|record| record.next_attempt_at)
            .filter(|at| *at > now)
            .min()
        else {
            return Ok(());
        };
        let delay = (wake_at - now)
            .to_std()
            .unwrap_or(Duration::from_millis(1));
        let handle = self.handle.clone();
        debug!(?delay, "arming wake-up timer for delayed jobs");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.notify_work();
        });
        Ok(())
    }
}

/// Transitive pending dependents of `id`, payloads included so that failure
/// callbacks can still be constructed.
async fn collect_pending_dependents(
    txn: &mut sqlx::SqliteTransaction<'_>,
    id: JobId,
) -> anyhow::Result<Vec<JobRecord>> {
    let mut queue = vec![id];
    let mut seen = HashSet::from([id]);
    let mut dependents = Vec::new();
    while let Some(id) = queue.pop() {
        for dependent_id in JobRecord::pending_dependents(txn.as_mut(), id).await? {
            if !seen.insert(dependent_id) {
                continue;
            }
            if let Some(record) = JobRecord::load(txn.as_mut(), dependent_id).await? {
                queue.push(dependent_id);
                dependents.push(record);
            }
        }
    }
    Ok(dependents)
}

/// Runs a single job attempt: payload migration, factory dispatch, execution.
///
/// All failure modes are converted into a [`JobOutcome`]; nothing escapes the
/// per-job boundary.
async fn run_job(
    mut record: JobRecord,
    registry: Arc<JobRegistry>,
    migrations: Arc<MigrationChain>,
    ctx: JobContext,
) -> (JobRecord, JobOutcome) {
    if record.schema_version < migrations.current_version() {
        if let Err(error) = migrate_record(&mut record, &migrations, &ctx).await {
            error!(%error, id = %record.id, "payload migration failed");
            return (record, JobOutcome::Failure(error));
        }
    }

    let mut executable = match registry.create(&record.factory_key, &record.payload) {
        Ok(executable) => executable,
        Err(error) => {
            // A missing factory is a programmer error; the job is failed
            // loudly instead of being silently dropped.
            error!(%error, id = %record.id, factory_key = %record.factory_key,
                "failed to construct job");
            return (record, JobOutcome::Failure(error));
        }
    };

    debug!(
        id = %record.id,
        factory_key = %record.factory_key,
        attempt = record.current_attempt + 1,
        "running job"
    );
    let outcome = executable.run(&ctx).await;
    (record, outcome)
}

/// Applies the migration chain to the record and persists the result, along
/// with any compensating jobs a legacy migration returns.
async fn migrate_record(
    record: &mut JobRecord,
    migrations: &MigrationChain,
    ctx: &JobContext,
) -> anyhow::Result<()> {
    let output = migrations.migrate(
        record.schema_version,
        &record.factory_key,
        record.payload.clone(),
    )?;
    let current_version = migrations.current_version();
    let now = ctx.clock.now();
    ctx.pool
        .with_transaction(async |txn| {
            JobRecord::update_payload(txn.as_mut(), record.id, &output.payload, current_version)
                .await?;
            for job in &output.extra_jobs {
                JobRecord::insert(txn, job, now, current_version).await?;
            }
            Ok(())
        })
        .await?;
    record.payload = output.payload;
    record.schema_version = current_version;
    Ok(())
}

/// A token sent to the background task as work permit.
///
/// The token is stored in a [`tokio::sync::watch`] cell. Whenever the token is
/// updated, the background task is woken up and uses the token to start work
/// (if it is not running yet). When the token is cancelled, the background
/// work (if any) is cancelled.
///
/// The token also contains a `done` token which is *shared* between the
/// callers and the background task. The background task uses it to mark the
/// work as done.
#[derive(Debug, Default, Clone)]
struct RunToken {
    cancel: CancellationToken,
    done: CancellationToken,
}

impl RunToken {
    fn new() -> Self {
        Default::default()
    }

    fn new_cancelled() -> Self {
        let run_token = RunToken::new();
        run_token.cancel();
        run_token.mark_as_done();
        run_token
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn rotate(&mut self) -> bool {
        if self.is_cancelled() {
            *self = RunToken::new();
            true
        } else {
            false
        }
    }

    fn rotate_done(&mut self) -> bool {
        if self.done.is_cancelled() {
            self.done = CancellationToken::new();
            true
        } else {
            false
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn mark_as_done(&self) {
        self.done.cancel();
    }
}

/// A future that resolves when the background task is done.
///
/// This future is not marked as `must_use`, because the default usage of the
/// apis returning this future is not to wait for its completion.
#[pin_project]
pub struct WaitForDoneFuture {
    #[pin]
    done_fut: Option<WaitForCancellationFutureOwned>,
}

impl WaitForDoneFuture {
    fn new(done: Option<CancellationToken>) -> Self {
        Self {
            done_fut: done.map(|done| done.cancelled_owned()),
        }
    }
}

impl Future for WaitForDoneFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().done_fut.as_pin_mut() {
            Some(fut) => fut.poll(cx),
            None => Poll::Ready(()),
        }
    }
}
