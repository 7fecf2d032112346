// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! One poll loop per event family.
//!
//! A cycle runs in two short transactions around the step's chain work:
//!
//! ```text
//!  Idle ──tick──► Polling                         Applying                        Idle
//!                 tx#1: acquire lease row         step.evaluate(snapshot)         (next tick)
//!                       claim: updated_at =       (RPC, policy, send tx,
//!                         now + lease_ttl          wait for receipt)
//!                       step.load(snapshot)       tx#2: reacquire(claim)
//!                 commit                                apply effects
//!                                                       complete | release | defer
//!                                                 commit
//! ```
//!
//! The claim written in tx#1 keeps other executors off the row while no transaction is
//! open; `reacquire` in tx#2 fences out an executor whose claim expired meanwhile.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, RelayerError, RelayerResult};
use crate::metrics::RelayerMetrics;
use crate::storage::{Store, StoreTx, TransactionalWork};
use crate::tx_executor::TransactionRetryExecutor;
use crate::types::{ItemStatus, ProcessingJob};

/// Which job rows a family runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseTarget {
    /// A single long-lived row, created at start and never deleted.
    Standing(String),
    /// Any row whose name starts with the prefix; each row is one unit of work and is
    /// deleted once done.
    Queue(String),
}

impl LeaseTarget {
    fn is_queue(&self) -> bool {
        matches!(self, LeaseTarget::Queue(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    /// Upstream is not ready. The lease is deferred by `retry_after`.
    NotYetActionable,
}

/// A storage write requested by a step, applied in the same transaction that settles the
/// lease.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEffect {
    AdvanceProgress {
        event_name: String,
        block_number: u64,
    },
    EnsureJob {
        name: String,
        options: serde_json::Value,
    },
    SetItemsStatus {
        family: String,
        ids: Vec<String>,
        status: ItemStatus,
    },
    LinkBlockToBatch {
        l2_block_number: u64,
        batch_index: u64,
    },
    SetBatchOptions {
        batch_index: u64,
        options: serde_json::Value,
    },
    SetBatchL1TxHash {
        batch_index: u64,
        tx_hash: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepDecision {
    pub outcome: StepOutcome,
    pub effects: Vec<StepEffect>,
}

impl StepDecision {
    pub fn done() -> Self {
        Self {
            outcome: StepOutcome::Done,
            effects: vec![],
        }
    }

    pub fn not_yet() -> Self {
        Self {
            outcome: StepOutcome::NotYetActionable,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: StepEffect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn advance(self, event_name: &str, block_number: u64) -> Self {
        self.with_effect(StepEffect::AdvanceProgress {
            event_name: event_name.to_string(),
            block_number,
        })
    }
}

/// The family-specific half of a cycle.
///
/// `load` runs inside the claiming transaction and must only touch storage. `evaluate`
/// runs with no transaction open; it may call chains and send transactions, and reports
/// every storage write it wants as a [`StepEffect`].
#[async_trait]
pub trait BusinessStep: Send + Sync + 'static {
    type Snapshot: Send + Sync + 'static;

    fn family(&self) -> &str;

    fn lease(&self) -> LeaseTarget;

    async fn load(&self, tx: &mut dyn StoreTx, job: &ProcessingJob)
        -> RelayerResult<Self::Snapshot>;

    async fn evaluate(
        &self,
        job: &ProcessingJob,
        snapshot: Self::Snapshot,
    ) -> RelayerResult<StepDecision>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Polling,
    Applying,
    Cancelled,
}

impl SchedulerState {
    fn gauge_value(&self) -> i64 {
        match self {
            SchedulerState::Idle => 0,
            SchedulerState::Polling => 1,
            SchedulerState::Applying => 2,
            SchedulerState::Cancelled => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    NotAcquired,
    Done,
    NotYetActionable,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::NotAcquired => "not_acquired",
            CycleOutcome::Done => "done",
            CycleOutcome::NotYetActionable => "not_yet_actionable",
        }
    }
}

impl From<StepOutcome> for CycleOutcome {
    fn from(outcome: StepOutcome) -> Self {
        match outcome {
            StepOutcome::Done => CycleOutcome::Done,
            StepOutcome::NotYetActionable => CycleOutcome::NotYetActionable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// How long a claim keeps other executors away while the step talks to the chains.
    pub lease_ttl: Duration,
    /// Deferral applied on `NotYetActionable`.
    pub retry_after: Duration,
    /// Stop the family on a fatal error instead of logging and waiting for the next tick.
    pub stop_on_error: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(600),
            retry_after: Duration::from_secs(10),
            stop_on_error: true,
        }
    }
}

pub struct SyncScheduler<S, B> {
    step: Arc<B>,
    executor: TransactionRetryExecutor<S>,
    config: SchedulerConfig,
    lease_ttl: chrono::Duration,
    retry_after: chrono::Duration,
    metrics: Option<Arc<RelayerMetrics>>,
    state: watch::Sender<SchedulerState>,
}

impl<S: Store, B: BusinessStep> SyncScheduler<S, B> {
    pub fn new(
        step: Arc<B>,
        executor: TransactionRetryExecutor<S>,
        config: SchedulerConfig,
    ) -> RelayerResult<Self> {
        if config.tick_interval.is_zero() {
            return Err(RelayerError::Config(format!(
                "{}: tick interval must be positive",
                step.family()
            )));
        }
        if config.lease_ttl.is_zero() {
            return Err(RelayerError::Config(format!(
                "{}: lease ttl must be positive",
                step.family()
            )));
        }
        let lease_ttl = to_chrono(step.family(), "lease ttl", config.lease_ttl)?;
        let retry_after = to_chrono(step.family(), "retry after", config.retry_after)?;
        let (state, _) = watch::channel(SchedulerState::Idle);
        Ok(Self {
            step,
            executor,
            config,
            lease_ttl,
            retry_after,
            metrics: None,
            state,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn family(&self) -> &str {
        self.step.family()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<RelayerResult<()>> {
        tokio::spawn(self.run(cancel))
    }

    /// Ticks until `cancel` fires. A cycle in flight is always finished first; nothing is
    /// acquired once cancelled.
    pub async fn run(self, cancel: CancellationToken) -> RelayerResult<()> {
        let family = self.family().to_string();
        let mut standing = match self.step.lease() {
            LeaseTarget::Standing(name) => Some(name),
            LeaseTarget::Queue(_) => None,
        };
        info!(
            "[{}] Scheduler started, tick every {:?}",
            family, self.config.tick_interval
        );

        let mut interval = time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.set_state(SchedulerState::Cancelled);
                    info!("[{}] Scheduler cancelled", family);
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            if let Some(name) = &standing {
                match self.executor.execute(&EnsureStandingLease { name }).await {
                    Ok(()) => standing = None,
                    Err(e) if e.kind() != ErrorKind::Fatal => {
                        warn!("[{}] Cannot create lease yet, retrying next tick: {}", family, e);
                        continue;
                    }
                    Err(e) => {
                        error!("[{}] Cannot create lease, stopping scheduler: {}", family, e);
                        self.set_state(SchedulerState::Cancelled);
                        return Err(e);
                    }
                }
            }

            match self.run_cycle().await {
                Ok(outcome) => debug!("[{}] Cycle finished: {}", family, outcome.as_str()),
                Err(e) => match e.kind() {
                    ErrorKind::StorageTransient | ErrorKind::NextTick => {
                        warn!("[{}] Cycle failed, retrying next tick: {}", family, e);
                    }
                    ErrorKind::Fatal if self.config.stop_on_error && stops_family(&e) => {
                        error!("[{}] Fatal error, stopping scheduler: {}", family, e);
                        self.set_state(SchedulerState::Cancelled);
                        return Err(e);
                    }
                    ErrorKind::Fatal => {
                        error!("[{}] Cycle failed: {}", family, e);
                    }
                },
            }
        }
    }

    /// One tick's worth of work. Always returns to `Idle`.
    pub async fn run_cycle(&self) -> RelayerResult<CycleOutcome> {
        let started = Instant::now();
        let result = self.cycle().await;
        self.set_state(SchedulerState::Idle);

        if let Some(metrics) = &self.metrics {
            let family = self.family();
            match &result {
                Ok(outcome) => {
                    metrics
                        .cycles_total
                        .with_label_values(&[family, outcome.as_str()])
                        .inc();
                    if *outcome != CycleOutcome::NotAcquired {
                        metrics
                            .cycle_latency_seconds
                            .with_label_values(&[family])
                            .observe(started.elapsed().as_secs_f64());
                    }
                }
                Err(e) => {
                    metrics
                        .cycles_total
                        .with_label_values(&[family, "error"])
                        .inc();
                    metrics
                        .step_errors_total
                        .with_label_values(&[family, e.error_type()])
                        .inc();
                }
            }
        }
        result
    }

    async fn cycle(&self) -> RelayerResult<CycleOutcome> {
        let family = self.family();
        let target = self.step.lease();

        self.set_state(SchedulerState::Polling);
        let claim = self
            .executor
            .execute(&ClaimAndLoad {
                step: self.step.as_ref(),
                target: &target,
                lease_ttl: self.lease_ttl,
            })
            .await?;
        let Some(Claim {
            job,
            claimed_until,
            snapshot,
        }) = claim
        else {
            debug!("[{}] Lease not acquired, skipping tick", family);
            if let Some(metrics) = &self.metrics {
                metrics
                    .lease_not_acquired_total
                    .with_label_values(&[family])
                    .inc();
            }
            return Ok(CycleOutcome::NotAcquired);
        };

        self.set_state(SchedulerState::Applying);
        debug!("[{}] Claimed '{}' until {}", family, job.name, claimed_until);
        let decision = match self.step.evaluate(&job, snapshot).await {
            Ok(decision) => decision,
            Err(e) => {
                let release = ReleaseClaim {
                    name: &job.name,
                    claimed_until,
                };
                if let Err(release_err) = self.executor.execute(&release).await {
                    warn!(
                        "[{}] Failed to release claim on '{}': {}",
                        family, job.name, release_err
                    );
                }
                return Err(e);
            }
        };

        self.executor
            .execute(&ApplyDecision {
                name: &job.name,
                claimed_until,
                queue: target.is_queue(),
                decision: &decision,
                retry_after: self.retry_after,
            })
            .await?;

        for effect in &decision.effects {
            if let StepEffect::AdvanceProgress {
                event_name,
                block_number,
            } = effect
            {
                info!(
                    "[{}] Progress '{}' advanced to block {}",
                    family, event_name, block_number
                );
                if let Some(metrics) = &self.metrics {
                    metrics
                        .last_processed_block
                        .with_label_values(&[event_name.as_str()])
                        .set(i64::try_from(*block_number).unwrap_or(i64::MAX));
                }
            }
        }
        match decision.outcome {
            StepOutcome::Done => info!("[{}] '{}' done", family, job.name),
            StepOutcome::NotYetActionable => debug!(
                "[{}] '{}' not yet actionable, retry in {:?}",
                family, job.name, self.config.retry_after
            ),
        }
        Ok(decision.outcome.into())
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
        if let Some(metrics) = &self.metrics {
            metrics
                .scheduler_state
                .with_label_values(&[self.family()])
                .set(state.gauge_value());
        }
    }
}

/// Reverts end the cycle but never the family; the next tick re-evaluates.
fn stops_family(err: &RelayerError) -> bool {
    !matches!(err, RelayerError::Reverted { .. })
}

fn to_chrono(family: &str, what: &str, duration: Duration) -> RelayerResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| RelayerError::Config(format!("{}: {} {:?}: {}", family, what, duration, e)))
}

/// Postgres keeps microseconds; the claim must compare equal after a round trip.
fn claim_timestamp(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

struct Claim<T> {
    job: ProcessingJob,
    claimed_until: DateTime<Utc>,
    snapshot: T,
}

struct EnsureStandingLease<'a> {
    name: &'a str,
}

#[async_trait]
impl<'a> TransactionalWork for EnsureStandingLease<'a> {
    type Output = ();

    async fn run(&self, tx: &mut dyn StoreTx) -> RelayerResult<()> {
        tx.ensure_job(self.name, &serde_json::json!({})).await
    }
}

struct ClaimAndLoad<'a, B> {
    step: &'a B,
    target: &'a LeaseTarget,
    lease_ttl: chrono::Duration,
}

#[async_trait]
impl<'a, B: BusinessStep> TransactionalWork for ClaimAndLoad<'a, B> {
    type Output = Option<Claim<B::Snapshot>>;

    async fn run(&self, tx: &mut dyn StoreTx) -> RelayerResult<Self::Output> {
        let acquired = match self.target {
            LeaseTarget::Standing(name) => tx.try_acquire_job(name).await?,
            LeaseTarget::Queue(prefix) => tx.try_acquire_job_by_prefix(prefix).await?,
        };
        let Some(job) = acquired else {
            return Ok(None);
        };
        let claim = claim_timestamp(Utc::now() + self.lease_ttl);
        let job = tx.touch_job(&job.name, claim).await?.ok_or_else(|| {
            RelayerError::Internal(format!("job '{}' vanished while locked", job.name))
        })?;
        let snapshot = self.step.load(tx, &job).await?;
        Ok(Some(Claim {
            claimed_until: job.updated_at,
            job,
            snapshot,
        }))
    }
}

struct ApplyDecision<'a> {
    name: &'a str,
    claimed_until: DateTime<Utc>,
    queue: bool,
    decision: &'a StepDecision,
    retry_after: chrono::Duration,
}

#[async_trait]
impl<'a> TransactionalWork for ApplyDecision<'a> {
    type Output = ();

    async fn run(&self, tx: &mut dyn StoreTx) -> RelayerResult<()> {
        if tx
            .reacquire_job(self.name, self.claimed_until)
            .await?
            .is_none()
        {
            return Err(RelayerError::LeaseLost(self.name.to_string()));
        }
        for effect in &self.decision.effects {
            apply_effect(tx, effect).await?;
        }
        let now = claim_timestamp(Utc::now());
        match self.decision.outcome {
            StepOutcome::Done if self.queue => tx.complete_job(self.name).await?,
            StepOutcome::Done => {
                tx.touch_job(self.name, now).await?;
            }
            StepOutcome::NotYetActionable => {
                tx.touch_job(self.name, claim_timestamp(now + self.retry_after))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Hands the row back for the next tick after a failed evaluation.
struct ReleaseClaim<'a> {
    name: &'a str,
    claimed_until: DateTime<Utc>,
}

#[async_trait]
impl<'a> TransactionalWork for ReleaseClaim<'a> {
    type Output = ();

    async fn run(&self, tx: &mut dyn StoreTx) -> RelayerResult<()> {
        if tx
            .reacquire_job(self.name, self.claimed_until)
            .await?
            .is_some()
        {
            tx.touch_job(self.name, claim_timestamp(Utc::now())).await?;
        }
        Ok(())
    }
}

async fn apply_effect(tx: &mut dyn StoreTx, effect: &StepEffect) -> RelayerResult<()> {
    match effect {
        StepEffect::AdvanceProgress {
            event_name,
            block_number,
        } => {
            tx.upsert_progress(event_name, *block_number).await?;
        }
        StepEffect::EnsureJob { name, options } => tx.ensure_job(name, options).await?,
        StepEffect::SetItemsStatus {
            family,
            ids,
            status,
        } => tx.set_items_status(family, ids, *status).await?,
        StepEffect::LinkBlockToBatch {
            l2_block_number,
            batch_index,
        } => tx.link_block_to_batch(*l2_block_number, *batch_index).await?,
        StepEffect::SetBatchOptions {
            batch_index,
            options,
        } => tx.set_batch_options(*batch_index, options).await?,
        StepEffect::SetBatchL1TxHash {
            batch_index,
            tx_hash,
        } => {
            tx.set_batch_l1_verified_tx_hash(*batch_index, tx_hash)
                .await?
        }
    }
    Ok(())
}
