// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::Address;
use tracing::{debug, info, warn};

use super::record_submission;
use crate::error::RelayerResult;
use crate::event_source::{block_age, ChainEventData, ChainEventSource, EventKind};
use crate::metrics::RelayerMetrics;
use crate::policy::SubmissionPolicy;
use crate::scheduler::{BusinessStep, LeaseTarget, StepDecision};
use crate::storage::{progress_or_zero, StoreTx};
use crate::transactor::{is_already_executed, L2MessengerTransactor};
use crate::types::{ProcessingJob, SENT_MESSAGE_EVENT};

pub const MESSENGER_RELAYER_FAMILY: &str = "messenger_relayer";

/// Relays base-chain `SentMessage` events to the rollup messenger, one transaction each.
pub struct MessengerRelayerStep {
    source: Arc<dyn ChainEventSource>,
    l1_messenger: Address,
    l2_messenger: Arc<dyn L2MessengerTransactor>,
    policy: SubmissionPolicy,
    metrics: Option<Arc<RelayerMetrics>>,
}

impl MessengerRelayerStep {
    pub fn new(
        source: Arc<dyn ChainEventSource>,
        l1_messenger: Address,
        l2_messenger: Arc<dyn L2MessengerTransactor>,
        policy: SubmissionPolicy,
    ) -> Self {
        Self {
            source,
            l1_messenger,
            l2_messenger,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl BusinessStep for MessengerRelayerStep {
    type Snapshot = u64;

    fn family(&self) -> &str {
        MESSENGER_RELAYER_FAMILY
    }

    fn lease(&self) -> LeaseTarget {
        LeaseTarget::Standing(MESSENGER_RELAYER_FAMILY.to_string())
    }

    async fn load(&self, tx: &mut dyn StoreTx, _job: &ProcessingJob) -> RelayerResult<u64> {
        progress_or_zero(tx, SENT_MESSAGE_EVENT).await
    }

    async fn evaluate(
        &self,
        _job: &ProcessingJob,
        last_processed: u64,
    ) -> RelayerResult<StepDecision> {
        let batch = self
            .source
            .filter(
                self.l1_messenger,
                EventKind::SentMessage,
                last_processed + 1,
                None,
            )
            .await?;
        let Some(max_block) = batch.max_block_seen else {
            return Ok(StepDecision::not_yet());
        };
        if batch.events.is_empty() {
            debug!(
                "[{}] No messages up to block {}",
                MESSENGER_RELAYER_FAMILY, max_block
            );
            return Ok(StepDecision::not_yet().advance(SENT_MESSAGE_EVENT, max_block));
        }

        let oldest_age = block_age(self.source.as_ref(), batch.events[0].block_number).await?;
        if !self
            .policy
            .should_submit(batch.events.len() as u64, oldest_age)
        {
            return Ok(StepDecision::not_yet());
        }

        for event in &batch.events {
            let ChainEventData::SentMessage(message) = &event.data else {
                continue;
            };
            let result = self.l2_messenger.relay_message(message).await;
            record_submission(&self.metrics, MESSENGER_RELAYER_FAMILY, &result);
            match result {
                Ok(receipt) => info!(
                    "[{}] Relayed message nonce {} from block {} in {:?}",
                    MESSENGER_RELAYER_FAMILY,
                    message.message_nonce,
                    event.block_number,
                    receipt.tx_hash
                ),
                Err(e) if is_already_executed(&e) => warn!(
                    "[{}] Message nonce {} was already executed",
                    MESSENGER_RELAYER_FAMILY, message.message_nonce
                ),
                Err(e) => return Err(e),
            }
        }
        Ok(StepDecision::done().advance(SENT_MESSAGE_EVENT, max_block))
    }
}
