// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Family-specific business steps plugged into [`crate::scheduler::SyncScheduler`].

use std::sync::Arc;

use ethers::types::U256;

use crate::error::RelayerResult;
use crate::metrics::RelayerMetrics;
use crate::transactor::{is_already_executed, TxReceiptInfo};

pub mod deposit_analyzer;
pub mod deposit_relayer;
pub mod l2_batch_index;
pub mod messenger_relayer;
pub mod withdrawal_aggregator;
pub mod withdrawal_relayer;

pub use deposit_analyzer::{
    AcceptAllScreener, AnalyzerMode, DepositAnalyzerStep, DepositScreener,
    DEPOSIT_ANALYZER_FAMILY,
};
pub use deposit_relayer::{DepositRelayerStep, DEPOSIT_RELAYER_FAMILY};
pub use l2_batch_index::{
    enqueue_l2_block, L2BatchIndexStep, L2BlockNumberStep, L2_BATCH_INDEX_FAMILY,
    L2_BLOCK_NUMBER_FAMILY,
};
pub use messenger_relayer::{MessengerRelayerStep, MESSENGER_RELAYER_FAMILY};
pub use withdrawal_aggregator::{WithdrawalAggregatorStep, WITHDRAWAL_AGGREGATOR_FAMILY};
pub use withdrawal_relayer::{WithdrawalRelayerStep, WITHDRAWAL_RELAYER_FAMILY};

const DEPOSIT_BASE_GAS: u64 = 220_000;
const DEPOSIT_GAS_PER_DEPOSIT: u64 = 20_000;
const DEPOSIT_GAS_BUFFER: u64 = 100_000;

/// Gas limit forwarded for relaying `deposit_count` deposits to the rollup chain.
pub fn deposit_gas_limit(deposit_count: usize) -> U256 {
    U256::from(DEPOSIT_BASE_GAS)
        + U256::from(DEPOSIT_GAS_PER_DEPOSIT) * U256::from(deposit_count)
        + U256::from(DEPOSIT_GAS_BUFFER)
}

pub(crate) fn record_submission(
    metrics: &Option<Arc<RelayerMetrics>>,
    family: &str,
    result: &RelayerResult<TxReceiptInfo>,
) {
    let Some(metrics) = metrics else {
        return;
    };
    let status = match result {
        Ok(_) => "success",
        Err(e) if is_already_executed(e) => "already_executed",
        Err(e) if e.revert_reason().is_some() => "reverted",
        Err(_) => "error",
    };
    metrics
        .submitted_transactions_total
        .with_label_values(&[family, status])
        .inc();
}
