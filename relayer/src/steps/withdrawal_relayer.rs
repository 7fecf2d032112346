// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::record_submission;
use crate::bridge_api::ClaimableMessageSource;
use crate::error::RelayerResult;
use crate::metrics::RelayerMetrics;
use crate::policy::SubmissionPolicy;
use crate::scheduler::{BusinessStep, LeaseTarget, StepDecision};
use crate::storage::StoreTx;
use crate::transactor::{is_already_executed, L1MessengerTransactor};
use crate::types::ProcessingJob;

pub const WITHDRAWAL_RELAYER_FAMILY: &str = "withdrawal_relayer";

/// Claims rollup-to-base messages the bridge API reports as provable.
pub struct WithdrawalRelayerStep {
    bridge: Arc<dyn ClaimableMessageSource>,
    messenger: Arc<dyn L1MessengerTransactor>,
    policy: SubmissionPolicy,
    metrics: Option<Arc<RelayerMetrics>>,
}

impl WithdrawalRelayerStep {
    pub fn new(
        bridge: Arc<dyn ClaimableMessageSource>,
        messenger: Arc<dyn L1MessengerTransactor>,
        policy: SubmissionPolicy,
    ) -> Self {
        Self {
            bridge,
            messenger,
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
impl BusinessStep for WithdrawalRelayerStep {
    type Snapshot = ();

    fn family(&self) -> &str {
        WITHDRAWAL_RELAYER_FAMILY
    }

    fn lease(&self) -> LeaseTarget {
        LeaseTarget::Standing(WITHDRAWAL_RELAYER_FAMILY.to_string())
    }

    async fn load(&self, _tx: &mut dyn StoreTx, _job: &ProcessingJob) -> RelayerResult<()> {
        Ok(())
    }

    async fn evaluate(&self, _job: &ProcessingJob, _snapshot: ()) -> RelayerResult<StepDecision> {
        let messages = self.bridge.claimable_messages().await?;
        // The API does not expose message age, so only the count drives the policy.
        if !self.policy.should_submit(messages.len() as u64, Duration::ZERO) {
            debug!(
                "[{}] {} claimable messages, waiting",
                WITHDRAWAL_RELAYER_FAMILY,
                messages.len()
            );
            return Ok(StepDecision::not_yet());
        }

        for message in &messages {
            let result = self.messenger.relay_message_with_proof(message).await;
            record_submission(&self.metrics, WITHDRAWAL_RELAYER_FAMILY, &result);
            match result {
                Ok(receipt) => info!(
                    "[{}] Claimed message nonce {} in {:?}",
                    WITHDRAWAL_RELAYER_FAMILY, message.nonce, receipt.tx_hash
                ),
                Err(e) if is_already_executed(&e) => warn!(
                    "[{}] Message nonce {} was already claimed",
                    WITHDRAWAL_RELAYER_FAMILY, message.nonce
                ),
                Err(e) => return Err(e),
            }
        }
        Ok(StepDecision::done())
    }
}
