// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::Detokenize;
use ethers::contract::{ContractCall, ContractError};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256, U64};

use super::{
    fixed_deposit_value, L1MessengerTransactor, L2MessengerTransactor, LiquidityTransactor,
    TxReceiptInfo, WithdrawalProof, WithdrawalRequest, WithdrawalTransactor,
};
use crate::abi::{
    self, ChainedWithdrawal, L1ScrollMessenger, L2MessageProof, L2ScrollMessenger, Liquidity,
    Withdrawal,
};
use crate::bridge_api::ClaimableMessage;
use crate::error::{RelayerError, RelayerResult};
use crate::event_source::SentMessage;

pub type EthSigner = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Private key + chain id gives a signing client.
pub async fn build_signer(
    rpc_url: &str,
    private_key_hex: &str,
    chain_id: u64,
) -> anyhow::Result<Arc<EthSigner>> {
    let provider = Provider::<Http>::try_from(rpc_url)?.interval(Duration::from_millis(2000));
    let wallet = LocalWallet::from_str(private_key_hex.trim_start_matches("0x"))
        .map_err(|e| anyhow::anyhow!("invalid private key: {}", e))?
        .with_chain_id(chain_id);
    Ok(Arc::new(SignerMiddleware::new(provider, wallet)))
}

pub struct EthLiquidityTransactor<M> {
    contract: Liquidity<M>,
}

impl<M: Middleware + 'static> EthLiquidityTransactor<M> {
    pub fn new(address: Address, client: Arc<M>) -> Self {
        Self {
            contract: Liquidity::new(address, client),
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> LiquidityTransactor for EthLiquidityTransactor<M> {
    async fn analyze_and_relay_deposits(
        &self,
        up_to_deposit_id: U256,
        reject_deposit_ids: Vec<U256>,
        gas_limit: U256,
    ) -> RelayerResult<TxReceiptInfo> {
        let call = self
            .contract
            .analyze_and_relay_deposits(up_to_deposit_id, reject_deposit_ids, gas_limit)
            .value(fixed_deposit_value());
        send_and_confirm("analyzeAndRelayDeposits", call).await
    }

    async fn analyze_deposits(
        &self,
        up_to_deposit_id: U256,
        reject_deposit_ids: Vec<U256>,
    ) -> RelayerResult<TxReceiptInfo> {
        let call = self
            .contract
            .analyze_deposits(up_to_deposit_id, reject_deposit_ids);
        send_and_confirm("analyzeDeposits", call).await
    }

    async fn relay_deposits(
        &self,
        max_last_seen_deposit_index: U256,
        gas_limit: U256,
    ) -> RelayerResult<TxReceiptInfo> {
        let call = self
            .contract
            .relay_deposits(max_last_seen_deposit_index, gas_limit)
            .value(fixed_deposit_value());
        send_and_confirm("relayDeposits", call).await
    }
}

pub struct EthWithdrawalTransactor<M> {
    contract: Withdrawal<M>,
}

impl<M: Middleware + 'static> EthWithdrawalTransactor<M> {
    pub fn new(address: Address, client: Arc<M>) -> Self {
        Self {
            contract: Withdrawal::new(address, client),
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> WithdrawalTransactor for EthWithdrawalTransactor<M> {
    async fn submit_withdrawal_proof(
        &self,
        withdrawals: &[WithdrawalRequest],
        proof: &WithdrawalProof,
    ) -> RelayerResult<TxReceiptInfo> {
        let withdrawals = withdrawals
            .iter()
            .map(|w| ChainedWithdrawal {
                recipient: w.recipient,
                token_index: w.token_index,
                amount: w.amount,
                nullifier: w.nullifier.to_fixed_bytes(),
                block_hash: w.block_hash.to_fixed_bytes(),
                block_number: w.block_number,
            })
            .collect::<Vec<_>>();
        let public_inputs = abi::WithdrawalProofPublicInputs {
            last_withdrawal_hash: proof.public_inputs.last_withdrawal_hash.to_fixed_bytes(),
            withdrawal_aggregator: proof.public_inputs.withdrawal_aggregator,
        };
        let call =
            self.contract
                .submit_withdrawal_proof(withdrawals, public_inputs, proof.proof.clone());
        send_and_confirm("submitWithdrawalProof", call).await
    }
}

pub struct EthL2MessengerTransactor<M> {
    contract: L2ScrollMessenger<M>,
}

impl<M: Middleware + 'static> EthL2MessengerTransactor<M> {
    pub fn new(address: Address, client: Arc<M>) -> Self {
        Self {
            contract: L2ScrollMessenger::new(address, client),
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> L2MessengerTransactor for EthL2MessengerTransactor<M> {
    async fn relay_message(&self, message: &SentMessage) -> RelayerResult<TxReceiptInfo> {
        let call = self.contract.relay_message(
            message.sender,
            message.target,
            message.value,
            message.message_nonce,
            message.message.clone(),
        );
        send_and_confirm("relayMessage", call).await
    }
}

pub struct EthL1MessengerTransactor<M> {
    contract: L1ScrollMessenger<M>,
}

impl<M: Middleware + 'static> EthL1MessengerTransactor<M> {
    pub fn new(address: Address, client: Arc<M>) -> Self {
        Self {
            contract: L1ScrollMessenger::new(address, client),
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> L1MessengerTransactor for EthL1MessengerTransactor<M> {
    async fn relay_message_with_proof(
        &self,
        message: &ClaimableMessage,
    ) -> RelayerResult<TxReceiptInfo> {
        let call = self.contract.relay_message_with_proof(
            message.from,
            message.to,
            message.value,
            message.nonce,
            message.message.clone(),
            L2MessageProof {
                batch_index: message.batch_index,
                merkle_proof: message.merkle_proof.clone(),
            },
        );
        send_and_confirm("relayMessageWithProof", call).await
    }
}

async fn send_and_confirm<M, D>(
    label: &str,
    call: ContractCall<M, D>,
) -> RelayerResult<TxReceiptInfo>
where
    M: Middleware + 'static,
    D: Detokenize + Send + Sync,
{
    let pending = call.send().await.map_err(contract_error)?;
    let tx_hash = pending.tx_hash();
    tracing::info!("[Transactor] {} sent, tx_hash={:?}", label, tx_hash);

    let receipt = pending.await?.ok_or_else(|| {
        RelayerError::Rpc(format!(
            "{} transaction {:?} dropped before it was mined",
            label, tx_hash
        ))
    })?;
    let block_number = receipt
        .block_number
        .ok_or_else(|| RelayerError::Decode(format!("receipt of {:?} has no block", tx_hash)))?
        .as_u64();

    if receipt.status != Some(U64::from(1)) {
        tracing::error!(
            "[Transactor] {} reverted, tx_hash={:?}, block={}",
            label,
            tx_hash,
            block_number
        );
        return Err(RelayerError::Reverted {
            tx_hash: Some(tx_hash),
            reason: format!("{} receipt status {:?}", label, receipt.status),
        });
    }
    tracing::info!(
        "[Transactor] {} mined, tx_hash={:?}, block={}",
        label,
        tx_hash,
        block_number
    );
    Ok(TxReceiptInfo {
        tx_hash,
        block_number,
    })
}

/// Reverts caught while estimating gas carry the contract's reason string.
fn contract_error<M: Middleware>(err: ContractError<M>) -> RelayerError {
    if let Some(reason) = err.decode_revert::<String>() {
        return RelayerError::Reverted {
            tx_hash: None,
            reason,
        };
    }
    if err.is_revert() {
        return RelayerError::Reverted {
            tx_hash: None,
            reason: err.to_string(),
        };
    }
    RelayerError::Rpc(err.to_string())
}
