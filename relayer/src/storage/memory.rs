// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`Store`] for tests.
//!
//! Writes go straight to shared state and are recorded in an undo log, so a rolled back (or
//! dropped) transaction restores what it touched. Job rows acquired by an open transaction are
//! held in a lock set that other transactions skip, mirroring `FOR UPDATE SKIP LOCKED`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    BatchIndexStore, EventProgressStore, PendingItemStore, ProcessingJobLease, Store,
    TransactionalWork,
};
use crate::error::{RelayerError, RelayerResult};
use crate::types::{
    EventProgress, ItemStatus, L2BatchIndex, PendingSubmissionItem, ProcessingJob,
};

#[derive(Default)]
struct MemState {
    progress: BTreeMap<String, EventProgress>,
    jobs: BTreeMap<String, ProcessingJob>,
    items: BTreeMap<(String, String), PendingSubmissionItem>,
    batches: BTreeMap<u64, L2BatchIndex>,
    block_batches: BTreeMap<u64, u64>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<MemState>,
    locks: Mutex<HashSet<String>>,
    injected_conflicts: AtomicU32,
    injected_outages: AtomicU32,
    transactions: AtomicU32,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

enum Undo {
    Progress(String, Option<EventProgress>),
    Job(String, Option<ProcessingJob>),
    Item((String, String), Option<PendingSubmissionItem>),
    Batch(u64, Option<L2BatchIndex>),
    BlockBatch(u64, Option<u64>),
}

pub struct MemoryTx {
    inner: Arc<Inner>,
    undo: Vec<Undo>,
    held: Vec<String>,
    finished: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` commits fail with a storage conflict and roll back.
    pub fn inject_conflicts(&self, n: u32) {
        self.inner.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// The next `n` transactions fail to open, as if the database were unreachable.
    pub fn inject_outages(&self, n: u32) {
        self.inner.injected_outages.store(n, Ordering::SeqCst);
    }

    /// Number of transactions opened through [`Store::run_in_transaction`].
    pub fn transactions(&self) -> u32 {
        self.inner.transactions.load(Ordering::SeqCst)
    }

    pub fn begin(&self) -> MemoryTx {
        MemoryTx {
            inner: self.inner.clone(),
            undo: Vec::new(),
            held: Vec::new(),
            finished: false,
        }
    }

    pub fn progress(&self, event_name: &str) -> Option<u64> {
        self.state()
            .progress
            .get(event_name)
            .map(|p| p.last_processed_block)
    }

    pub fn job(&self, name: &str) -> Option<ProcessingJob> {
        self.state().jobs.get(name).cloned()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.state().jobs.keys().cloned().collect()
    }

    pub fn item_status(&self, family: &str, id: &str) -> Option<ItemStatus> {
        self.state()
            .items
            .get(&(family.to_string(), id.to_string()))
            .map(|i| i.status)
    }

    pub fn batch(&self, batch_index: u64) -> Option<L2BatchIndex> {
        self.state().batches.get(&batch_index).cloned()
    }

    pub fn batch_of_block(&self, l2_block_number: u64) -> Option<u64> {
        self.state().block_batches.get(&l2_block_number).copied()
    }

    /// Sets a job's `updated_at` directly, bypassing locks.
    pub fn set_job_updated_at(&self, name: &str, updated_at: DateTime<Utc>) {
        if let Some(job) = self.state().jobs.get_mut(name) {
            job.updated_at = updated_at;
        }
    }

    /// Sets an item's `created_at` directly to age it.
    pub fn set_item_created_at(&self, family: &str, id: &str, created_at: DateTime<Utc>) {
        if let Some(item) = self
            .state()
            .items
            .get_mut(&(family.to_string(), id.to_string()))
        {
            item.created_at = created_at;
        }
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        lock(&self.inner.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTx {
    pub fn commit(mut self) -> RelayerResult<()> {
        let conflict = self
            .inner
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflict {
            self.rollback_in_place();
            return Err(RelayerError::StorageConflict(
                "could not serialize access due to concurrent update".to_string(),
            ));
        }
        self.undo.clear();
        self.release();
        Ok(())
    }

    pub fn rollback(mut self) {
        self.rollback_in_place();
    }

    fn rollback_in_place(&mut self) {
        {
            let mut state = lock(&self.inner.state);
            while let Some(undo) = self.undo.pop() {
                match undo {
                    Undo::Progress(k, v) => restore(&mut state.progress, k, v),
                    Undo::Job(k, v) => restore(&mut state.jobs, k, v),
                    Undo::Item(k, v) => restore(&mut state.items, k, v),
                    Undo::Batch(k, v) => restore(&mut state.batches, k, v),
                    Undo::BlockBatch(k, v) => restore(&mut state.block_batches, k, v),
                }
            }
        }
        self.release();
    }

    fn release(&mut self) {
        let mut locks = lock(&self.inner.locks);
        for name in self.held.drain(..) {
            locks.remove(&name);
        }
        self.finished = true;
    }

    /// Locks `name` for this transaction unless someone else holds it.
    fn try_lock(&mut self, name: &str) -> bool {
        if self.held.iter().any(|h| h == name) {
            return true;
        }
        let mut locks = lock(&self.inner.locks);
        if locks.insert(name.to_string()) {
            self.held.push(name.to_string());
            true
        } else {
            false
        }
    }

    fn locked_by_other(&self, name: &str) -> bool {
        !self.held.iter().any(|h| h == name) && lock(&self.inner.locks).contains(name)
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        lock(&self.inner.state)
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback_in_place();
        }
    }
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, previous: Option<V>) {
    match previous {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn run_in_transaction<W>(&self, work: &W) -> RelayerResult<W::Output>
    where
        W: TransactionalWork,
    {
        self.inner.transactions.fetch_add(1, Ordering::SeqCst);
        let outage = self
            .inner
            .injected_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if outage.is_ok() {
            return Err(RelayerError::StorageUnavailable(
                "failed to get connection: timed out".into(),
            ));
        }
        let mut tx = self.begin();
        match work.run(&mut tx).await {
            Ok(output) => {
                tx.commit()?;
                Ok(output)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl EventProgressStore for MemoryTx {
    async fn upsert_progress(
        &mut self,
        event_name: &str,
        block_number: u64,
    ) -> RelayerResult<EventProgress> {
        let (previous, current) = {
            let mut state = self.state();
            let previous = state.progress.get(event_name).cloned();
            let block = previous
                .as_ref()
                .map_or(block_number, |p| p.last_processed_block.max(block_number));
            let current = EventProgress {
                event_name: event_name.to_string(),
                last_processed_block: block,
                updated_at: Utc::now(),
            };
            state
                .progress
                .insert(event_name.to_string(), current.clone());
            (previous, current)
        };
        self.undo
            .push(Undo::Progress(event_name.to_string(), previous));
        Ok(current)
    }

    async fn get_progress(&mut self, event_name: &str) -> RelayerResult<Option<EventProgress>> {
        Ok(self.state().progress.get(event_name).cloned())
    }

    async fn get_many_progress(&mut self, names: &[&str]) -> RelayerResult<Vec<EventProgress>> {
        let state = self.state();
        Ok(names
            .iter()
            .filter_map(|n| state.progress.get(*n).cloned())
            .collect())
    }
}

#[async_trait]
impl ProcessingJobLease for MemoryTx {
    async fn ensure_job(&mut self, name: &str, options: &serde_json::Value) -> RelayerResult<()> {
        let inserted = {
            let mut state = self.state();
            if state.jobs.contains_key(name) {
                false
            } else {
                let now = Utc::now();
                state.jobs.insert(
                    name.to_string(),
                    ProcessingJob {
                        name: name.to_string(),
                        options: options.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                true
            }
        };
        if inserted {
            self.undo.push(Undo::Job(name.to_string(), None));
        }
        Ok(())
    }

    async fn try_acquire_job(&mut self, name: &str) -> RelayerResult<Option<ProcessingJob>> {
        let candidate = self
            .state()
            .jobs
            .get(name)
            .filter(|j| j.updated_at <= Utc::now())
            .cloned();
        match candidate {
            Some(job) if self.try_lock(&job.name) => Ok(Some(job)),
            _ => Ok(None),
        }
    }

    async fn try_acquire_job_by_prefix(
        &mut self,
        prefix: &str,
    ) -> RelayerResult<Option<ProcessingJob>> {
        let now = Utc::now();
        let mut candidates: Vec<ProcessingJob> = self
            .state()
            .jobs
            .values()
            .filter(|j| j.name.starts_with(prefix) && j.updated_at <= now)
            .cloned()
            .collect();
        candidates.sort_by_key(|j| j.updated_at);
        for job in candidates {
            if self.try_lock(&job.name) {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn reacquire_job(
        &mut self,
        name: &str,
        claimed_until: DateTime<Utc>,
    ) -> RelayerResult<Option<ProcessingJob>> {
        if self.locked_by_other(name) {
            return Ok(None);
        }
        let candidate = self
            .state()
            .jobs
            .get(name)
            .filter(|j| j.updated_at == claimed_until)
            .cloned();
        match candidate {
            Some(job) if self.try_lock(&job.name) => Ok(Some(job)),
            _ => Ok(None),
        }
    }

    async fn touch_job(
        &mut self,
        name: &str,
        updated_at: DateTime<Utc>,
    ) -> RelayerResult<Option<ProcessingJob>> {
        let touched = {
            let mut state = self.state();
            match state.jobs.get_mut(name) {
                Some(job) => {
                    let previous = job.clone();
                    job.updated_at = updated_at;
                    Some((previous, job.clone()))
                }
                None => None,
            }
        };
        Ok(touched.map(|(previous, current)| {
            self.undo.push(Undo::Job(name.to_string(), Some(previous)));
            current
        }))
    }

    async fn complete_job(&mut self, name: &str) -> RelayerResult<()> {
        let previous = self.state().jobs.remove(name);
        if previous.is_some() {
            self.undo.push(Undo::Job(name.to_string(), previous));
        }
        Ok(())
    }
}

#[async_trait]
impl PendingItemStore for MemoryTx {
    async fn enqueue_item(
        &mut self,
        family: &str,
        id: &str,
        payload: &serde_json::Value,
    ) -> RelayerResult<()> {
        let key = (family.to_string(), id.to_string());
        let inserted = {
            let mut state = self.state();
            if state.items.contains_key(&key) {
                false
            } else {
                state.items.insert(
                    key.clone(),
                    PendingSubmissionItem {
                        family: family.to_string(),
                        id: id.to_string(),
                        payload: payload.clone(),
                        status: ItemStatus::Pending,
                        created_at: Utc::now(),
                    },
                );
                true
            }
        };
        if inserted {
            self.undo.push(Undo::Item(key, None));
        }
        Ok(())
    }

    async fn pending_items(
        &mut self,
        family: &str,
        limit: usize,
    ) -> RelayerResult<Vec<PendingSubmissionItem>> {
        let mut items: Vec<PendingSubmissionItem> = self
            .state()
            .items
            .values()
            .filter(|i| i.family == family && i.status == ItemStatus::Pending)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn set_items_status(
        &mut self,
        family: &str,
        ids: &[String],
        status: ItemStatus,
    ) -> RelayerResult<()> {
        let mut previous = Vec::new();
        {
            let mut state = self.state();
            for id in ids {
                let key = (family.to_string(), id.clone());
                if let Some(item) = state.items.get_mut(&key) {
                    previous.push((key, item.clone()));
                    item.status = status;
                }
            }
        }
        for (key, item) in previous {
            self.undo.push(Undo::Item(key, Some(item)));
        }
        Ok(())
    }
}

#[async_trait]
impl BatchIndexStore for MemoryTx {
    async fn batch_index(&mut self, batch_index: u64) -> RelayerResult<Option<L2BatchIndex>> {
        Ok(self.state().batches.get(&batch_index).cloned())
    }

    async fn link_block_to_batch(
        &mut self,
        l2_block_number: u64,
        batch_index: u64,
    ) -> RelayerResult<()> {
        let (batch_created, previous_link) = {
            let mut state = self.state();
            let batch_created = if state.batches.contains_key(&batch_index) {
                false
            } else {
                state.batches.insert(
                    batch_index,
                    L2BatchIndex {
                        batch_index,
                        options: None,
                        l1_verified_batch_tx_hash: None,
                    },
                );
                true
            };
            let previous_link = state.block_batches.insert(l2_block_number, batch_index);
            (batch_created, previous_link)
        };
        if batch_created {
            self.undo.push(Undo::Batch(batch_index, None));
        }
        self.undo
            .push(Undo::BlockBatch(l2_block_number, previous_link));
        Ok(())
    }

    async fn set_batch_options(
        &mut self,
        batch_index: u64,
        options: &serde_json::Value,
    ) -> RelayerResult<()> {
        let previous = {
            let mut state = self.state();
            state.batches.get_mut(&batch_index).map(|b| {
                let previous = b.clone();
                b.options = Some(options.clone());
                previous
            })
        };
        if let Some(previous) = previous {
            self.undo.push(Undo::Batch(batch_index, Some(previous)));
        }
        Ok(())
    }

    async fn set_batch_l1_verified_tx_hash(
        &mut self,
        batch_index: u64,
        tx_hash: &str,
    ) -> RelayerResult<()> {
        let previous = {
            let mut state = self.state();
            state.batches.get_mut(&batch_index).map(|b| {
                let previous = b.clone();
                b.l1_verified_batch_tx_hash = Some(tx_hash.to_string());
                previous
            })
        };
        if let Some(previous) = previous {
            self.undo.push(Undo::Batch(batch_index, Some(previous)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    // ============================================================================
    // Lease Tests
    // ============================================================================

    #[tokio::test]
    async fn test_concurrent_try_acquire_yields_one_winner() {
        let store = MemoryStore::new();
        let mut setup = store.begin();
        setup
            .ensure_job("deposit_relayer", &serde_json::json!({}))
            .await
            .unwrap();
        setup.commit().unwrap();

        let mut tx1 = store.begin();
        let mut tx2 = store.begin();
        let first = tx1.try_acquire_job("deposit_relayer").await.unwrap();
        let second = tx2.try_acquire_job("deposit_relayer").await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        // Lock is released once the holder finishes.
        tx1.commit().unwrap();
        assert!(tx2.try_acquire_job("deposit_relayer").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_try_acquire_missing_row_is_not_acquired() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        assert!(tx.try_acquire_job("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deferred_job_is_invisible_until_due() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.ensure_job("job", &serde_json::json!({})).await.unwrap();
        tx.touch_job("job", Utc::now() + ChronoDuration::minutes(5))
            .await
            .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin();
        assert!(tx.try_acquire_job("job").await.unwrap().is_none());
        tx.rollback();

        store.set_job_updated_at("job", Utc::now() - ChronoDuration::seconds(1));
        let mut tx = store.begin();
        assert!(tx.try_acquire_job("job").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.ensure_job("job", &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        tx.ensure_job("job", &serde_json::json!({"a": 2}))
            .await
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(
            store.job("job").unwrap().options,
            serde_json::json!({"a": 1})
        );
    }

    #[tokio::test]
    async fn test_prefix_acquisition_takes_oldest_unlocked() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.ensure_job("l2_batch_index_2", &serde_json::json!({}))
            .await
            .unwrap();
        tx.ensure_job("l2_batch_index_1", &serde_json::json!({}))
            .await
            .unwrap();
        tx.ensure_job("other", &serde_json::json!({})).await.unwrap();
        tx.commit().unwrap();
        store.set_job_updated_at("l2_batch_index_1", Utc::now() - ChronoDuration::minutes(2));
        store.set_job_updated_at("l2_batch_index_2", Utc::now() - ChronoDuration::minutes(1));

        let mut tx1 = store.begin();
        let mut tx2 = store.begin();
        let a = tx1
            .try_acquire_job_by_prefix("l2_batch_index_")
            .await
            .unwrap()
            .unwrap();
        let b = tx2
            .try_acquire_job_by_prefix("l2_batch_index_")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.name, "l2_batch_index_1");
        assert_eq!(b.name, "l2_batch_index_2");
    }

    #[tokio::test]
    async fn test_reacquire_requires_matching_claim() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.ensure_job("job", &serde_json::json!({})).await.unwrap();
        let claimed = tx
            .touch_job("job", Utc::now() + ChronoDuration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin();
        assert!(tx
            .reacquire_job("job", claimed.updated_at + ChronoDuration::seconds(1))
            .await
            .unwrap()
            .is_none());
        assert!(tx
            .reacquire_job("job", claimed.updated_at)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_complete_deletes_row() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.ensure_job("job", &serde_json::json!({})).await.unwrap();
        tx.complete_job("job").await.unwrap();
        tx.commit().unwrap();
        assert!(store.job("job").is_none());
    }

    // ============================================================================
    // Progress Tests
    // ============================================================================

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        assert_eq!(tx.upsert_progress("Deposits", 100).await.unwrap().last_processed_block, 100);
        assert_eq!(tx.upsert_progress("Deposits", 90).await.unwrap().last_processed_block, 100);
        assert_eq!(tx.upsert_progress("Deposits", 140).await.unwrap().last_processed_block, 140);
        tx.commit().unwrap();
        assert_eq!(store.progress("Deposits"), Some(140));
    }

    #[tokio::test]
    async fn test_get_many_skips_unknown_names() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.upsert_progress("A", 1).await.unwrap();
        let found = tx.get_many_progress(&["A", "B"]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].event_name, "A");
        assert!(tx.get_progress("B").await.unwrap().is_none());
    }

    // ============================================================================
    // Rollback Tests
    // ============================================================================

    #[tokio::test]
    async fn test_rollback_restores_everything() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.upsert_progress("A", 10).await.unwrap();
        tx.ensure_job("job", &serde_json::json!({})).await.unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin();
        tx.upsert_progress("A", 20).await.unwrap();
        tx.complete_job("job").await.unwrap();
        tx.link_block_to_batch(5, 1).await.unwrap();
        tx.rollback();

        assert_eq!(store.progress("A"), Some(10));
        assert!(store.job("job").is_some());
        assert!(store.batch(1).is_none());
        assert!(store.batch_of_block(5).is_none());
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back_and_unlocks() {
        let store = MemoryStore::new();
        let mut setup = store.begin();
        setup.ensure_job("job", &serde_json::json!({})).await.unwrap();
        setup.commit().unwrap();

        {
            let mut tx = store.begin();
            tx.try_acquire_job("job").await.unwrap().unwrap();
            tx.upsert_progress("A", 5).await.unwrap();
        }
        assert_eq!(store.progress("A"), None);
        let mut tx = store.begin();
        assert!(tx.try_acquire_job("job").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_injected_conflict_rolls_back_commit() {
        let store = MemoryStore::new();
        store.inject_conflicts(1);
        let mut tx = store.begin();
        tx.upsert_progress("A", 5).await.unwrap();
        assert!(tx.commit().unwrap_err().is_storage_conflict());
        assert_eq!(store.progress("A"), None);

        let mut tx = store.begin();
        tx.upsert_progress("A", 5).await.unwrap();
        tx.commit().unwrap();
        assert_eq!(store.progress("A"), Some(5));
    }

    // ============================================================================
    // Pending Item Tests
    // ============================================================================

    #[tokio::test]
    async fn test_pending_items_oldest_first_with_limit() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        for id in ["a", "b", "c"] {
            tx.enqueue_item("withdrawal", id, &serde_json::json!({}))
                .await
                .unwrap();
        }
        tx.commit().unwrap();
        store.set_item_created_at("withdrawal", "c", Utc::now() - ChronoDuration::hours(1));

        let mut tx = store.begin();
        let items = tx.pending_items("withdrawal", 2).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "c");

        tx.set_items_status("withdrawal", &["c".to_string()], ItemStatus::Submitted)
            .await
            .unwrap();
        let items = tx.pending_items("withdrawal", 10).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.id != "c"));
    }
}
