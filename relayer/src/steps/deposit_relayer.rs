// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, U256};
use tracing::{debug, info, warn};

use super::{deposit_gas_limit, record_submission};
use crate::error::RelayerResult;
use crate::event_source::{block_age, last_event_since, ChainEventSource, EventKind};
use crate::metrics::RelayerMetrics;
use crate::policy::SubmissionPolicy;
use crate::scheduler::{BusinessStep, LeaseTarget, StepDecision};
use crate::storage::{progress_or_zero, StoreTx};
use crate::transactor::LiquidityTransactor;
use crate::types::{ProcessingJob, DEPOSITS_ANALYZED_EVENT, DEPOSITS_RELAYED_EVENT};

pub const DEPOSIT_RELAYER_FAMILY: &str = "deposit_relayer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayerMarkers {
    pub analyzed: u64,
    pub relayed: u64,
}

/// Relays deposits that were analyzed in a separate transaction.
pub struct DepositRelayerStep {
    source: Arc<dyn ChainEventSource>,
    liquidity: Address,
    transactor: Arc<dyn LiquidityTransactor>,
    policy: SubmissionPolicy,
    metrics: Option<Arc<RelayerMetrics>>,
}

impl DepositRelayerStep {
    pub fn new(
        source: Arc<dyn ChainEventSource>,
        liquidity: Address,
        transactor: Arc<dyn LiquidityTransactor>,
        policy: SubmissionPolicy,
    ) -> Self {
        Self {
            source,
            liquidity,
            transactor,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Age of deposit `relayed_id + 1`, the oldest one still waiting. It may have been mined
    /// before the last relay, so it is looked up by id.
    async fn oldest_pending_age(&self, relayed_id: U256) -> RelayerResult<Duration> {
        let oldest = self
            .source
            .find_deposit(self.liquidity, relayed_id + 1)
            .await?;
        match oldest {
            Some(event) => block_age(self.source.as_ref(), event.block_number).await,
            None => {
                warn!(
                    "[{}] Deposit {} not found on chain",
                    DEPOSIT_RELAYER_FAMILY,
                    relayed_id + 1
                );
                Ok(Duration::ZERO)
            }
        }
    }
}

#[async_trait]
impl BusinessStep for DepositRelayerStep {
    type Snapshot = RelayerMarkers;

    fn family(&self) -> &str {
        DEPOSIT_RELAYER_FAMILY
    }

    fn lease(&self) -> LeaseTarget {
        LeaseTarget::Standing(DEPOSIT_RELAYER_FAMILY.to_string())
    }

    async fn load(
        &self,
        tx: &mut dyn StoreTx,
        _job: &ProcessingJob,
    ) -> RelayerResult<RelayerMarkers> {
        let analyzed = progress_or_zero(tx, DEPOSITS_ANALYZED_EVENT).await?;
        let relayed = progress_or_zero(tx, DEPOSITS_RELAYED_EVENT).await?;
        Ok(RelayerMarkers { analyzed, relayed })
    }

    async fn evaluate(
        &self,
        _job: &ProcessingJob,
        markers: RelayerMarkers,
    ) -> RelayerResult<StepDecision> {
        let source = self.source.as_ref();
        let (analyzed, relayed) = tokio::try_join!(
            last_event_since(
                source,
                self.liquidity,
                EventKind::DepositsAnalyzed,
                markers.analyzed
            ),
            last_event_since(
                source,
                self.liquidity,
                EventKind::DepositsRelayed,
                markers.relayed
            ),
        )?;
        let Some(analyzed_id) = analyzed.and_then(|e| e.data.deposit_id()) else {
            debug!("[{}] Nothing analyzed yet", DEPOSIT_RELAYER_FAMILY);
            return Ok(StepDecision::not_yet());
        };
        let relayed_id = relayed
            .and_then(|e| e.data.deposit_id())
            .unwrap_or_default();
        if analyzed_id <= relayed_id {
            debug!(
                "[{}] Up to date at deposit id {}",
                DEPOSIT_RELAYER_FAMILY, relayed_id
            );
            return Ok(StepDecision::not_yet());
        }

        let delta = u64::try_from(analyzed_id - relayed_id).unwrap_or(u64::MAX);
        let oldest_age = self.oldest_pending_age(relayed_id).await?;
        if !self.policy.should_submit(delta, oldest_age) {
            debug!(
                "[{}] Waiting: {} deposits to relay, oldest {:?} old",
                DEPOSIT_RELAYER_FAMILY, delta, oldest_age
            );
            return Ok(StepDecision::not_yet());
        }

        info!(
            "[{}] Relaying deposits {}..={}",
            DEPOSIT_RELAYER_FAMILY,
            relayed_id + 1,
            analyzed_id
        );
        let gas_limit = deposit_gas_limit(usize::try_from(delta).unwrap_or(usize::MAX));
        let result = self.transactor.relay_deposits(analyzed_id, gas_limit).await;
        record_submission(&self.metrics, DEPOSIT_RELAYER_FAMILY, &result);
        let receipt = result?;

        Ok(StepDecision::done().advance(DEPOSITS_RELAYED_EVENT, receipt.block_number))
    }
}
