// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Aggregates pending withdrawal requests into one proven `submitWithdrawalProof` call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::Address;
use tracing::{debug, error, info, warn};

use super::record_submission;
use crate::error::RelayerResult;
use crate::metrics::RelayerMetrics;
use crate::policy::SubmissionPolicy;
use crate::prover::{proof_request_id, total_amount, PendingWithdrawal, WithdrawalProofProvider};
use crate::scheduler::{BusinessStep, LeaseTarget, StepDecision, StepEffect, StepOutcome};
use crate::storage::StoreTx;
use crate::transactor::{
    WithdrawalProof, WithdrawalProofPublicInputs, WithdrawalRequest, WithdrawalTransactor,
};
use crate::types::{ItemStatus, PendingSubmissionItem, ProcessingJob};

pub const WITHDRAWAL_AGGREGATOR_FAMILY: &str = "withdrawal_aggregator";
/// Item family holding withdrawal requests.
pub const WITHDRAWAL_ITEM_FAMILY: &str = "withdrawal";

const PROOF_VERIFICATION_FAILED: &str = "WithdrawalProofVerificationFailed";
const PROOF_VERIFICATION_FAILED_SIGNATURE: &str = "WithdrawalProofVerificationFailed()";

pub struct WithdrawalAggregatorStep {
    prover: Arc<dyn WithdrawalProofProvider>,
    transactor: Arc<dyn WithdrawalTransactor>,
    aggregator: Address,
    policy: SubmissionPolicy,
    metrics: Option<Arc<RelayerMetrics>>,
}

impl WithdrawalAggregatorStep {
    pub fn new(
        prover: Arc<dyn WithdrawalProofProvider>,
        transactor: Arc<dyn WithdrawalTransactor>,
        aggregator: Address,
        policy: SubmissionPolicy,
    ) -> Self {
        Self {
            prover,
            transactor,
            aggregator,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn batch_limit(&self) -> usize {
        usize::try_from(self.policy.threshold.max(1)).unwrap_or(usize::MAX)
    }
}

fn set_status(ids: Vec<String>, status: ItemStatus) -> StepEffect {
    StepEffect::SetItemsStatus {
        family: WITHDRAWAL_ITEM_FAMILY.to_string(),
        ids,
        status,
    }
}

/// Only the contract's own verification error counts; undecoded custom errors show up as raw
/// revert data starting with its selector.
fn is_proof_rejection(reason: &str) -> bool {
    let selector = format!(
        "0x{}",
        ethers::utils::hex::encode(ethers::utils::id(PROOF_VERIFICATION_FAILED_SIGNATURE))
    );
    reason.contains(PROOF_VERIFICATION_FAILED) || reason.to_lowercase().contains(&selector)
}

#[async_trait]
impl BusinessStep for WithdrawalAggregatorStep {
    type Snapshot = Vec<PendingSubmissionItem>;

    fn family(&self) -> &str {
        WITHDRAWAL_AGGREGATOR_FAMILY
    }

    fn lease(&self) -> LeaseTarget {
        LeaseTarget::Standing(WITHDRAWAL_AGGREGATOR_FAMILY.to_string())
    }

    async fn load(
        &self,
        tx: &mut dyn StoreTx,
        _job: &ProcessingJob,
    ) -> RelayerResult<Vec<PendingSubmissionItem>> {
        tx.pending_items(WITHDRAWAL_ITEM_FAMILY, self.batch_limit())
            .await
    }

    async fn evaluate(
        &self,
        _job: &ProcessingJob,
        items: Vec<PendingSubmissionItem>,
    ) -> RelayerResult<StepDecision> {
        let Some(oldest) = items.iter().map(|i| i.created_at).min() else {
            debug!("[{}] No pending withdrawals", WITHDRAWAL_AGGREGATOR_FAMILY);
            return Ok(StepDecision::not_yet());
        };
        let oldest_age = (Utc::now() - oldest).to_std().unwrap_or_default();
        if !self.policy.should_submit(items.len() as u64, oldest_age) {
            debug!(
                "[{}] Waiting: {} pending withdrawals, oldest {:?} old",
                WITHDRAWAL_AGGREGATOR_FAMILY,
                items.len(),
                oldest_age
            );
            return Ok(StepDecision::not_yet());
        }

        let mut withdrawals = Vec::with_capacity(items.len());
        let mut malformed = vec![];
        for item in items {
            match serde_json::from_value::<PendingWithdrawal>(item.payload) {
                Ok(mut withdrawal) => {
                    withdrawal.id = item.id;
                    withdrawals.push(withdrawal);
                }
                Err(e) => {
                    error!(
                        "[{}] Dropping withdrawal {} with malformed payload: {}",
                        WITHDRAWAL_AGGREGATOR_FAMILY, item.id, e
                    );
                    malformed.push(item.id);
                }
            }
        }
        let mut decision = StepDecision::not_yet();
        if !malformed.is_empty() {
            decision = decision.with_effect(set_status(malformed, ItemStatus::Failed));
        }
        if withdrawals.is_empty() {
            return Ok(decision);
        }

        let request_id = proof_request_id(&withdrawals);
        let Some(proof) = self
            .prover
            .prove(&request_id, &withdrawals, self.aggregator)
            .await?
        else {
            info!(
                "[{}] Proof {} for {} withdrawals not ready yet",
                WITHDRAWAL_AGGREGATOR_FAMILY,
                request_id,
                withdrawals.len()
            );
            return Ok(decision);
        };

        let requests: Vec<WithdrawalRequest> =
            withdrawals.iter().map(|w| w.withdrawal.clone()).collect();
        let proof = WithdrawalProof {
            public_inputs: WithdrawalProofPublicInputs::for_withdrawals(
                &requests,
                self.aggregator,
            ),
            proof,
        };
        let ids: Vec<String> = withdrawals.iter().map(|w| w.id.clone()).collect();
        info!(
            "[{}] Submitting {} withdrawals, total amount {}",
            WITHDRAWAL_AGGREGATOR_FAMILY,
            withdrawals.len(),
            total_amount(&withdrawals)
        );

        let result = self
            .transactor
            .submit_withdrawal_proof(&requests, &proof)
            .await;
        record_submission(&self.metrics, WITHDRAWAL_AGGREGATOR_FAMILY, &result);
        decision.outcome = StepOutcome::Done;
        match result {
            Ok(receipt) => {
                info!(
                    "[{}] Submitted {} withdrawals in {:?}",
                    WITHDRAWAL_AGGREGATOR_FAMILY,
                    ids.len(),
                    receipt.tx_hash
                );
                Ok(decision.with_effect(set_status(ids, ItemStatus::Submitted)))
            }
            Err(e) if e.revert_reason().is_some_and(is_proof_rejection) => {
                warn!(
                    "[{}] Proof rejected, marking {} withdrawals failed: {}",
                    WITHDRAWAL_AGGREGATOR_FAMILY,
                    ids.len(),
                    e
                );
                Ok(decision.with_effect(set_status(ids, ItemStatus::Failed)))
            }
            Err(e) => Err(e),
        }
    }
}
