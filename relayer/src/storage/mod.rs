// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Storage seam for the relayer.
//!
//! Everything the schedulers coordinate through lives behind [`StoreTx`], the set of
//! operations available inside one open transaction. A [`Store`] opens transactions and runs
//! a [`TransactionalWork`] inside them; commit happens only when the work returns `Ok`.
//!
//! ```text
//!   TransactionRetryExecutor ──► Store::run_in_transaction(work)
//!                                   │  BEGIN
//!                                   ├─► work.run(&mut dyn StoreTx)
//!                                   │     ├─ EventProgressStore
//!                                   │     ├─ ProcessingJobLease
//!                                   │     ├─ PendingItemStore
//!                                   │     └─ BatchIndexStore
//!                                   └─ COMMIT / ROLLBACK
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RelayerResult;
use crate::types::{
    EventProgress, ItemStatus, L2BatchIndex, PendingSubmissionItem, ProcessingJob,
};

#[cfg(test)]
pub mod memory;
pub mod pg;

/// Durable `event_name -> last_processed_block` map.
#[async_trait]
pub trait EventProgressStore: Send {
    /// Insert-or-update keyed by name. The stored block never moves backwards.
    async fn upsert_progress(
        &mut self,
        event_name: &str,
        block_number: u64,
    ) -> RelayerResult<EventProgress>;

    /// `None` means the event was never polled; callers treat it as block 0.
    async fn get_progress(&mut self, event_name: &str) -> RelayerResult<Option<EventProgress>>;

    async fn get_many_progress(&mut self, names: &[&str]) -> RelayerResult<Vec<EventProgress>>;
}

/// Named lock rows used as a distributed mutex and as a work queue.
#[async_trait]
pub trait ProcessingJobLease: Send {
    /// Enqueue idempotently; an existing row keeps its payload and timestamps.
    async fn ensure_job(&mut self, name: &str, options: &serde_json::Value) -> RelayerResult<()>;

    /// Row-locks the job without waiting. `None` when the row is absent, locked by another
    /// transaction, or deferred (`updated_at` in the future).
    async fn try_acquire_job(&mut self, name: &str) -> RelayerResult<Option<ProcessingJob>>;

    /// Same as [`Self::try_acquire_job`] over every job whose name starts with `prefix`,
    /// oldest `updated_at` first.
    async fn try_acquire_job_by_prefix(
        &mut self,
        prefix: &str,
    ) -> RelayerResult<Option<ProcessingJob>>;

    /// Row-locks the job only if it still carries the claim this executor wrote.
    async fn reacquire_job(
        &mut self,
        name: &str,
        claimed_until: DateTime<Utc>,
    ) -> RelayerResult<Option<ProcessingJob>>;

    async fn touch_job(
        &mut self,
        name: &str,
        updated_at: DateTime<Utc>,
    ) -> RelayerResult<Option<ProcessingJob>>;

    async fn complete_job(&mut self, name: &str) -> RelayerResult<()>;
}

#[async_trait]
pub trait PendingItemStore: Send {
    async fn enqueue_item(
        &mut self,
        family: &str,
        id: &str,
        payload: &serde_json::Value,
    ) -> RelayerResult<()>;

    /// Oldest pending items first.
    async fn pending_items(
        &mut self,
        family: &str,
        limit: usize,
    ) -> RelayerResult<Vec<PendingSubmissionItem>>;

    async fn set_items_status(
        &mut self,
        family: &str,
        ids: &[String],
        status: ItemStatus,
    ) -> RelayerResult<()>;
}

#[async_trait]
pub trait BatchIndexStore: Send {
    async fn batch_index(&mut self, batch_index: u64) -> RelayerResult<Option<L2BatchIndex>>;

    /// Creates the batch row if missing and links the L2 block to it.
    async fn link_block_to_batch(
        &mut self,
        l2_block_number: u64,
        batch_index: u64,
    ) -> RelayerResult<()>;

    async fn set_batch_options(
        &mut self,
        batch_index: u64,
        options: &serde_json::Value,
    ) -> RelayerResult<()>;

    async fn set_batch_l1_verified_tx_hash(
        &mut self,
        batch_index: u64,
        tx_hash: &str,
    ) -> RelayerResult<()>;
}

/// Everything available inside one open transaction.
pub trait StoreTx: EventProgressStore + ProcessingJobLease + PendingItemStore + BatchIndexStore {}

impl<T> StoreTx for T where
    T: EventProgressStore + ProcessingJobLease + PendingItemStore + BatchIndexStore
{
}

/// A unit of work that must run inside a single transaction.
#[async_trait]
pub trait TransactionalWork: Send + Sync {
    type Output: Send;

    async fn run(&self, tx: &mut dyn StoreTx) -> RelayerResult<Self::Output>;
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Opens a transaction, runs `work`, commits on `Ok` and rolls back on `Err`.
    ///
    /// Transient conflicts (including those raised at commit) surface as
    /// [`crate::error::RelayerError::StorageConflict`]; replaying is the caller's business.
    async fn run_in_transaction<W>(&self, work: &W) -> RelayerResult<W::Output>
    where
        W: TransactionalWork;
}

/// Reads a progress marker, treating "never polled" as block 0.
pub async fn progress_or_zero(tx: &mut dyn StoreTx, event_name: &str) -> RelayerResult<u64> {
    Ok(tx
        .get_progress(event_name)
        .await?
        .map(|p| p.last_processed_block)
        .unwrap_or(0))
}
