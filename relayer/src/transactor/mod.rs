// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Outbound transactions. Every call sends one transaction and waits for its receipt;
//! a receipt with a failed status comes back as [`RelayerError::Reverted`].

use async_trait::async_trait;
use ethers::types::{Address, Bytes, TxHash, H256, U256};
use serde::{Deserialize, Serialize};

use crate::bridge_api::ClaimableMessage;
use crate::error::{RelayerError, RelayerResult};
use crate::event_source::SentMessage;

mod eth;

pub use eth::{
    build_signer, EthL1MessengerTransactor, EthL2MessengerTransactor, EthLiquidityTransactor,
    EthSigner, EthWithdrawalTransactor,
};

/// Revert reason of a message relay that someone else already executed.
pub const MESSAGE_ALREADY_EXECUTED: &str = "Message was already successfully executed";

/// Value attached to deposit relays to pay for the L2 leg.
pub fn fixed_deposit_value() -> U256 {
    U256::exp10(17)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceiptInfo {
    pub tx_hash: TxHash,
    pub block_number: u64,
}

/// A revert we can treat as if our own transaction had succeeded.
pub fn is_already_executed(err: &RelayerError) -> bool {
    err.revert_reason()
        .is_some_and(|reason| reason.contains(MESSAGE_ALREADY_EXECUTED))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub recipient: Address,
    pub token_index: u32,
    pub amount: U256,
    pub nullifier: H256,
    pub block_hash: H256,
    pub block_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalProofPublicInputs {
    pub last_withdrawal_hash: H256,
    pub withdrawal_aggregator: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalProof {
    pub public_inputs: WithdrawalProofPublicInputs,
    pub proof: Bytes,
}

#[async_trait]
pub trait LiquidityTransactor: Send + Sync {
    async fn analyze_and_relay_deposits(
        &self,
        up_to_deposit_id: U256,
        reject_deposit_ids: Vec<U256>,
        gas_limit: U256,
    ) -> RelayerResult<TxReceiptInfo>;

    async fn analyze_deposits(
        &self,
        up_to_deposit_id: U256,
        reject_deposit_ids: Vec<U256>,
    ) -> RelayerResult<TxReceiptInfo>;

    async fn relay_deposits(
        &self,
        max_last_seen_deposit_index: U256,
        gas_limit: U256,
    ) -> RelayerResult<TxReceiptInfo>;
}

#[async_trait]
pub trait WithdrawalTransactor: Send + Sync {
    async fn submit_withdrawal_proof(
        &self,
        withdrawals: &[WithdrawalRequest],
        proof: &WithdrawalProof,
    ) -> RelayerResult<TxReceiptInfo>;
}

/// Rollup-chain messenger.
#[async_trait]
pub trait L2MessengerTransactor: Send + Sync {
    async fn relay_message(&self, message: &SentMessage) -> RelayerResult<TxReceiptInfo>;
}

/// Base-chain messenger.
#[async_trait]
pub trait L1MessengerTransactor: Send + Sync {
    async fn relay_message_with_proof(
        &self,
        message: &ClaimableMessage,
    ) -> RelayerResult<TxReceiptInfo>;
}
