// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Withdrawal proofs.
//!
//! The prover is an external service. Proving is asynchronous on its side, so a request is
//! keyed by an id derived from the withdrawals it covers: asking again on a later tick
//! polls the same job instead of starting a new one.

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RelayerError, RelayerResult};
use crate::transactor::{WithdrawalProofPublicInputs, WithdrawalRequest};

/// Payload of a pending `withdrawal` item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWithdrawal {
    #[serde(skip)]
    pub id: String,
    pub withdrawal: WithdrawalRequest,
    /// Prover input, passed through untouched.
    #[serde(default)]
    pub witness: serde_json::Value,
}

#[async_trait]
pub trait WithdrawalProofProvider: Send + Sync {
    /// `None` while the proof for `request_id` is still being generated.
    async fn prove(
        &self,
        request_id: &str,
        withdrawals: &[PendingWithdrawal],
        aggregator: Address,
    ) -> RelayerResult<Option<Bytes>>;
}

/// Stable id for a set of withdrawals.
pub fn proof_request_id(withdrawals: &[PendingWithdrawal]) -> String {
    let joined = withdrawals
        .iter()
        .map(|w| w.id.as_str())
        .collect::<Vec<_>>()
        .join(",");
    format!("0x{}", ethers::utils::hex::encode(keccak256(joined.as_bytes())))
}

/// `keccak256(prev, recipient, tokenIndex, amount, nullifier, blockHash, blockNumber)`,
/// packed big-endian.
pub fn chain_withdrawal_hash(prev: H256, withdrawal: &WithdrawalRequest) -> H256 {
    let mut packed = Vec::with_capacity(32 + 20 + 4 + 32 + 32 + 32 + 4);
    packed.extend_from_slice(prev.as_bytes());
    packed.extend_from_slice(withdrawal.recipient.as_bytes());
    packed.extend_from_slice(&withdrawal.token_index.to_be_bytes());
    let mut amount = [0u8; 32];
    withdrawal.amount.to_big_endian(&mut amount);
    packed.extend_from_slice(&amount);
    packed.extend_from_slice(withdrawal.nullifier.as_bytes());
    packed.extend_from_slice(withdrawal.block_hash.as_bytes());
    packed.extend_from_slice(&withdrawal.block_number.to_be_bytes());
    H256::from(keccak256(packed))
}

impl WithdrawalProofPublicInputs {
    pub fn for_withdrawals(withdrawals: &[WithdrawalRequest], aggregator: Address) -> Self {
        let last_withdrawal_hash = withdrawals
            .iter()
            .fold(H256::zero(), |prev, w| chain_withdrawal_hash(prev, w));
        Self {
            last_withdrawal_hash,
            withdrawal_aggregator: aggregator,
        }
    }

    pub fn hash(&self) -> H256 {
        let mut packed = Vec::with_capacity(52);
        packed.extend_from_slice(self.last_withdrawal_hash.as_bytes());
        packed.extend_from_slice(self.withdrawal_aggregator.as_bytes());
        H256::from(keccak256(packed))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProofRequest<'a> {
    id: &'a str,
    withdrawal_aggregator: String,
    withdrawals: &'a [PendingWithdrawal],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProofResponse {
    success: bool,
    proof: Option<String>,
    error_message: Option<String>,
}

pub struct HttpWithdrawalProver {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpWithdrawalProver {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> RelayerResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RelayerError::Config(format!("withdrawal prover url: {}", e)))
    }
}

#[async_trait]
impl WithdrawalProofProvider for HttpWithdrawalProver {
    async fn prove(
        &self,
        request_id: &str,
        withdrawals: &[PendingWithdrawal],
        aggregator: Address,
    ) -> RelayerResult<Option<Bytes>> {
        // Polling an existing job first avoids queueing a duplicate.
        let fetched = self
            .client
            .post(self.url(&format!("proof/{}", request_id))?)
            .json(&serde_json::json!({ "id": request_id }))
            .send()
            .await?;
        if fetched.status() == StatusCode::OK {
            if let Some(proof) = parse_proof_response(fetched.json().await?)? {
                return Ok(Some(proof));
            }
            return Ok(None);
        }

        let request = ProofRequest {
            id: request_id,
            withdrawal_aggregator: format!("{:?}", aggregator),
            withdrawals,
        };
        let response = self
            .client
            .post(self.url("proof")?)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        tracing::info!(
            "[Prover] Requested withdrawal proof {} for {} withdrawals",
            request_id,
            withdrawals.len()
        );
        parse_proof_response(response.json().await?)
    }
}

/// A response without a proof and without an error means "still proving".
fn parse_proof_response(response: ProofResponse) -> RelayerResult<Option<Bytes>> {
    if !response.success {
        if let Some(message) = response.error_message {
            return Err(RelayerError::Rpc(format!("prover request failed: {}", message)));
        }
        return Ok(None);
    }
    match response.proof {
        Some(proof) if !proof.is_empty() => proof
            .parse::<Bytes>()
            .map(Some)
            .map_err(|e| RelayerError::Decode(format!("withdrawal proof: {}", e))),
        _ => Ok(None),
    }
}

/// Total value moved by a set of withdrawals, for logs.
pub fn total_amount(withdrawals: &[PendingWithdrawal]) -> U256 {
    withdrawals
        .iter()
        .fold(U256::zero(), |acc, w| acc.saturating_add(w.withdrawal.amount))
}
