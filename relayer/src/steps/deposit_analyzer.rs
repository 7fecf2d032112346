// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Analyzes new deposits on the base chain and relays the accepted ones.
//!
//! Two markers drive it: `Deposits` (how far `Deposited` logs were scanned) and the block of
//! the last analysis event we emitted, from which the last analyzed deposit id is recovered.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{deposit_gas_limit, record_submission};
use crate::error::RelayerResult;
use crate::event_source::{block_age, last_event_since, ChainEvent, ChainEventSource, EventKind};
use crate::metrics::RelayerMetrics;
use crate::policy::SubmissionPolicy;
use crate::scheduler::{BusinessStep, LeaseTarget, StepDecision};
use crate::storage::StoreTx;
use crate::transactor::LiquidityTransactor;
use crate::types::{
    ProcessingJob, DEPOSITS_ANALYZED_AND_RELAYED_EVENT, DEPOSITS_ANALYZED_EVENT, DEPOSITS_EVENT,
};

pub const DEPOSIT_ANALYZER_FAMILY: &str = "deposit_analyzer";

/// Screens deposits before they are relayed (AML and similar).
#[async_trait]
pub trait DepositScreener: Send + Sync {
    /// Ids among `deposits` that must not reach the rollup chain.
    async fn rejected_deposit_ids(&self, deposits: &[ChainEvent]) -> RelayerResult<Vec<U256>>;
}

pub struct AcceptAllScreener;

#[async_trait]
impl DepositScreener for AcceptAllScreener {
    async fn rejected_deposit_ids(&self, _deposits: &[ChainEvent]) -> RelayerResult<Vec<U256>> {
        Ok(vec![])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalyzerMode {
    /// `analyzeAndRelayDeposits`, one transaction.
    #[default]
    AnalyzeAndRelay,
    /// `analyzeDeposits` only; relaying is left to the deposit relayer.
    AnalyzeOnly,
}

impl AnalyzerMode {
    fn marker(&self) -> (&'static str, EventKind) {
        match self {
            AnalyzerMode::AnalyzeAndRelay => (
                DEPOSITS_ANALYZED_AND_RELAYED_EVENT,
                EventKind::DepositsAnalyzedAndRelayed,
            ),
            AnalyzerMode::AnalyzeOnly => (DEPOSITS_ANALYZED_EVENT, EventKind::DepositsAnalyzed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzerMarkers {
    pub deposits: u64,
    pub analyzed: u64,
}

pub struct DepositAnalyzerStep {
    source: Arc<dyn ChainEventSource>,
    liquidity: Address,
    transactor: Arc<dyn LiquidityTransactor>,
    screener: Arc<dyn DepositScreener>,
    policy: SubmissionPolicy,
    mode: AnalyzerMode,
    metrics: Option<Arc<RelayerMetrics>>,
}

impl DepositAnalyzerStep {
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
            screener: Arc::new(AcceptAllScreener),
            policy,
            mode: AnalyzerMode::default(),
            metrics: None,
        }
    }

    pub fn with_screener(mut self, screener: Arc<dyn DepositScreener>) -> Self {
        self.screener = screener;
        self
    }

    pub fn with_mode(mut self, mode: AnalyzerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl BusinessStep for DepositAnalyzerStep {
    type Snapshot = AnalyzerMarkers;

    fn family(&self) -> &str {
        DEPOSIT_ANALYZER_FAMILY
    }

    fn lease(&self) -> LeaseTarget {
        LeaseTarget::Standing(DEPOSIT_ANALYZER_FAMILY.to_string())
    }

    async fn load(
        &self,
        tx: &mut dyn StoreTx,
        _job: &ProcessingJob,
    ) -> RelayerResult<AnalyzerMarkers> {
        let (marker_name, _) = self.mode.marker();
        let rows = tx.get_many_progress(&[DEPOSITS_EVENT, marker_name]).await?;
        let block_of = |name: &str| {
            rows.iter()
                .find(|p| p.event_name == name)
                .map_or(0, |p| p.last_processed_block)
        };
        Ok(AnalyzerMarkers {
            deposits: block_of(DEPOSITS_EVENT),
            analyzed: block_of(marker_name),
        })
    }

    async fn evaluate(
        &self,
        _job: &ProcessingJob,
        markers: AnalyzerMarkers,
    ) -> RelayerResult<StepDecision> {
        let (marker_name, marker_kind) = self.mode.marker();
        let source = self.source.as_ref();
        let (last_analysis, deposits) = tokio::try_join!(
            last_event_since(source, self.liquidity, marker_kind, markers.analyzed),
            source.filter(
                self.liquidity,
                EventKind::Deposited,
                markers.deposits + 1,
                None
            ),
        )?;
        let Some(max_block_seen) = deposits.max_block_seen else {
            debug!(
                "[{}] No new blocks since {}",
                DEPOSIT_ANALYZER_FAMILY, markers.deposits
            );
            return Ok(StepDecision::not_yet());
        };

        let last_analyzed_id = last_analysis
            .and_then(|e| e.data.deposit_id())
            .unwrap_or_default();
        let pending: Vec<ChainEvent> = deposits
            .events
            .into_iter()
            .filter(|e| e.data.deposit_id().is_some_and(|id| id > last_analyzed_id))
            .collect();
        let Some(first) = pending.first() else {
            debug!(
                "[{}] No deposits after id {} up to block {}",
                DEPOSIT_ANALYZER_FAMILY, last_analyzed_id, max_block_seen
            );
            return Ok(StepDecision::not_yet().advance(DEPOSITS_EVENT, max_block_seen));
        };

        let oldest_age = block_age(source, first.block_number).await?;
        if !self.policy.should_submit(pending.len() as u64, oldest_age) {
            debug!(
                "[{}] Waiting: {} pending deposits, oldest {:?} old",
                DEPOSIT_ANALYZER_FAMILY,
                pending.len(),
                oldest_age
            );
            return Ok(StepDecision::not_yet());
        }

        let up_to_deposit_id = pending
            .iter()
            .filter_map(|e| e.data.deposit_id())
            .max()
            .unwrap_or(last_analyzed_id);
        let rejected = self.screener.rejected_deposit_ids(&pending).await?;
        if !rejected.is_empty() {
            warn!(
                "[{}] Rejecting {} deposits: {:?}",
                DEPOSIT_ANALYZER_FAMILY,
                rejected.len(),
                rejected
            );
        }
        let relayed_count = pending.len().saturating_sub(rejected.len());
        info!(
            "[{}] Submitting {} deposits up to id {} ({} rejected)",
            DEPOSIT_ANALYZER_FAMILY,
            pending.len(),
            up_to_deposit_id,
            rejected.len()
        );

        let result = match self.mode {
            AnalyzerMode::AnalyzeAndRelay => {
                self.transactor
                    .analyze_and_relay_deposits(
                        up_to_deposit_id,
                        rejected,
                        deposit_gas_limit(relayed_count),
                    )
                    .await
            }
            AnalyzerMode::AnalyzeOnly => {
                self.transactor
                    .analyze_deposits(up_to_deposit_id, rejected)
                    .await
            }
        };
        record_submission(&self.metrics, DEPOSIT_ANALYZER_FAMILY, &result);
        let receipt = result?;

        Ok(StepDecision::done()
            .advance(DEPOSITS_EVENT, max_block_seen)
            .advance(marker_name, receipt.block_number))
    }
}
