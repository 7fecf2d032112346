// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Runs transactional work with bounded replay on serialization conflicts.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::metrics::RelayerMetrics;
use crate::storage::{Store, TransactionalWork};

pub struct TransactionRetryExecutor<S> {
    store: Arc<S>,
    commit_attempts_number: u32,
    commit_timeout: Duration,
    metrics: Option<Arc<RelayerMetrics>>,
}

impl<S> Clone for TransactionRetryExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            commit_attempts_number: self.commit_attempts_number,
            commit_timeout: self.commit_timeout,
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: Store> TransactionRetryExecutor<S> {
    pub fn new(store: Arc<S>, commit_attempts_number: u32, commit_timeout: Duration) -> Self {
        Self {
            store,
            commit_attempts_number,
            commit_timeout,
            metrics: None,
        }
    }

    pub fn from_config(store: Arc<S>, config: &DatabaseConfig) -> Self {
        Self::new(store, config.commit_attempts_number, config.commit_timeout)
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Runs `work` in a fresh transaction. A storage conflict is replayed after
    /// `commit_timeout`, at most `commit_attempts_number` times; the work must therefore
    /// be safe to run more than once.
    pub async fn execute<W>(&self, work: &W) -> RelayerResult<W::Output>
    where
        W: TransactionalWork,
    {
        let mut retries = 0u32;
        loop {
            match self.store.run_in_transaction(work).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_storage_conflict() => {
                    if retries >= self.commit_attempts_number {
                        return Err(RelayerError::RetriesExhausted {
                            attempts: retries + 1,
                            source: Box::new(e),
                        });
                    }
                    retries += 1;
                    warn!(
                        "[TxExecutor] Storage conflict, retrying ({}/{}) in {:?}: {}",
                        retries, self.commit_attempts_number, self.commit_timeout, e
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.tx_commit_retries_total.inc();
                    }
                    tokio::time::sleep(self.commit_timeout).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
