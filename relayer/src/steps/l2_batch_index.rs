// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Resolves rollup blocks to batches and records when a batch is finalized on the base chain.
//!
//! Both families are work queues: one `l2_block_number_<N>` job per block waiting for its
//! batch, then one `l2_batch_index_<bi>` job per batch waiting for finalization.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::error::{RelayerError, RelayerResult};
use crate::event_source::ChainEventSource;
use crate::explorer::RollupExplorer;
use crate::scheduler::{BusinessStep, LeaseTarget, StepDecision, StepEffect};
use crate::storage::StoreTx;
use crate::types::{
    job_batch_index, job_l2_block_number, l2_batch_index_job, l2_block_number_job,
    L2BatchIndex, ProcessingJob, L2_BATCH_INDEX_JOB_PREFIX, L2_BLOCK_NUMBER_JOB_PREFIX,
};

pub const L2_BLOCK_NUMBER_FAMILY: &str = "l2_block_number";
pub const L2_BATCH_INDEX_FAMILY: &str = "l2_batch_index";

/// Queues `l2_block_number` for batch resolution. Enqueueing the same block twice is a no-op.
pub async fn enqueue_l2_block(tx: &mut dyn StoreTx, l2_block_number: u64) -> RelayerResult<()> {
    let (name, options) = l2_block_number_job(l2_block_number);
    tx.ensure_job(&name, &options).await
}

/// A job whose payload cannot be read is dropped rather than retried forever.
fn drop_malformed(family: &str, job: &ProcessingJob, err: &RelayerError) -> StepDecision {
    error!("[{}] Dropping job '{}': {}", family, job.name, err);
    StepDecision::done()
}

pub struct L2BlockNumberStep {
    rollup: Arc<dyn ChainEventSource>,
    explorer: Arc<dyn RollupExplorer>,
}

impl L2BlockNumberStep {
    pub fn new(rollup: Arc<dyn ChainEventSource>, explorer: Arc<dyn RollupExplorer>) -> Self {
        Self { rollup, explorer }
    }
}

#[async_trait]
impl BusinessStep for L2BlockNumberStep {
    type Snapshot = ();

    fn family(&self) -> &str {
        L2_BLOCK_NUMBER_FAMILY
    }

    fn lease(&self) -> LeaseTarget {
        LeaseTarget::Queue(L2_BLOCK_NUMBER_JOB_PREFIX.to_string())
    }

    async fn load(&self, _tx: &mut dyn StoreTx, _job: &ProcessingJob) -> RelayerResult<()> {
        Ok(())
    }

    async fn evaluate(&self, job: &ProcessingJob, _snapshot: ()) -> RelayerResult<StepDecision> {
        let l2_block_number = match job_l2_block_number(job) {
            Ok(n) => n,
            Err(e) => return Ok(drop_malformed(L2_BLOCK_NUMBER_FAMILY, job, &e)),
        };
        let head = self.rollup.block_number().await?;
        if head < l2_block_number {
            debug!(
                "[{}] Block {} not produced yet, head is {}",
                L2_BLOCK_NUMBER_FAMILY, l2_block_number, head
            );
            return Ok(StepDecision::not_yet());
        }
        let Some(batch_index) = self.explorer.batch_index_of_block(l2_block_number).await? else {
            debug!(
                "[{}] Block {} is not in a batch yet",
                L2_BLOCK_NUMBER_FAMILY, l2_block_number
            );
            return Ok(StepDecision::not_yet());
        };

        info!(
            "[{}] Block {} belongs to batch {}",
            L2_BLOCK_NUMBER_FAMILY, l2_block_number, batch_index
        );
        let (name, options) = l2_batch_index_job(batch_index);
        Ok(StepDecision::done()
            .with_effect(StepEffect::LinkBlockToBatch {
                l2_block_number,
                batch_index,
            })
            .with_effect(StepEffect::EnsureJob { name, options }))
    }
}

pub struct L2BatchIndexStep {
    explorer: Arc<dyn RollupExplorer>,
}

impl L2BatchIndexStep {
    pub fn new(explorer: Arc<dyn RollupExplorer>) -> Self {
        Self { explorer }
    }
}

/// What the batch job found in storage.
#[derive(Debug)]
pub enum BatchSnapshot {
    Malformed(RelayerError),
    Missing(u64),
    Present(L2BatchIndex),
}

#[async_trait]
impl BusinessStep for L2BatchIndexStep {
    type Snapshot = BatchSnapshot;

    fn family(&self) -> &str {
        L2_BATCH_INDEX_FAMILY
    }

    fn lease(&self) -> LeaseTarget {
        LeaseTarget::Queue(L2_BATCH_INDEX_JOB_PREFIX.to_string())
    }

    async fn load(
        &self,
        tx: &mut dyn StoreTx,
        job: &ProcessingJob,
    ) -> RelayerResult<BatchSnapshot> {
        let batch_index = match job_batch_index(job) {
            Ok(bi) => bi,
            Err(e) => return Ok(BatchSnapshot::Malformed(e)),
        };
        Ok(match tx.batch_index(batch_index).await? {
            Some(batch) => BatchSnapshot::Present(batch),
            None => BatchSnapshot::Missing(batch_index),
        })
    }

    async fn evaluate(
        &self,
        job: &ProcessingJob,
        snapshot: BatchSnapshot,
    ) -> RelayerResult<StepDecision> {
        let batch_index = match snapshot {
            BatchSnapshot::Malformed(e) => {
                return Ok(drop_malformed(L2_BATCH_INDEX_FAMILY, job, &e))
            }
            BatchSnapshot::Missing(bi) => {
                debug!("[{}] Batch {} is not indexed, nothing to do", L2_BATCH_INDEX_FAMILY, bi);
                return Ok(StepDecision::done());
            }
            BatchSnapshot::Present(batch) => batch.batch_index,
        };

        let Some(info) = self.explorer.batch_info(batch_index).await? else {
            return Ok(StepDecision::not_yet());
        };
        let store_options = StepEffect::SetBatchOptions {
            batch_index,
            options: info.raw,
        };
        match info.finalize_tx_hash {
            Some(tx_hash) => {
                info!(
                    "[{}] Batch {} finalized in {}",
                    L2_BATCH_INDEX_FAMILY, batch_index, tx_hash
                );
                Ok(StepDecision::done()
                    .with_effect(store_options)
                    .with_effect(StepEffect::SetBatchL1TxHash {
                        batch_index,
                        tx_hash,
                    }))
            }
            None => {
                debug!(
                    "[{}] Batch {} not finalized yet",
                    L2_BATCH_INDEX_FAMILY, batch_index
                );
                Ok(StepDecision::not_yet().with_effect(store_options))
            }
        }
    }
}
