// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Unclaimed rollup-to-base withdrawals, as listed by the bridge API.

use std::str::FromStr;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde::Deserialize;
use url::Url;

use crate::error::{RelayerError, RelayerResult};

const PAGE_SIZE: u32 = 10;
const FIRST_PAGE: u32 = 1;

/// A rollup message that can be executed on the base chain with its proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimableMessage {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub nonce: U256,
    pub message: Bytes,
    pub batch_index: U256,
    pub merkle_proof: Bytes,
}

#[async_trait]
pub trait ClaimableMessageSource: Send + Sync {
    async fn claimable_messages(&self) -> RelayerResult<Vec<ClaimableMessage>>;
}

#[derive(Debug, Deserialize)]
struct UnclaimedResponse {
    data: Option<UnclaimedData>,
}

#[derive(Debug, Deserialize)]
struct UnclaimedData {
    #[serde(default)]
    results: Vec<UnclaimedResult>,
}

#[derive(Debug, Deserialize)]
struct UnclaimedResult {
    claim_info: Option<ClaimInfo>,
}

#[derive(Debug, Deserialize)]
struct ClaimInfo {
    from: String,
    to: String,
    value: String,
    nonce: String,
    message: String,
    proof: ClaimProof,
    claimable: bool,
}

#[derive(Debug, Deserialize)]
struct ClaimProof {
    batch_index: String,
    merkle_proof: String,
}

pub struct HttpBridgeApi {
    client: reqwest::Client,
    base_url: Url,
    withdrawal_contract: Address,
}

impl HttpBridgeApi {
    pub fn new(base_url: Url, withdrawal_contract: Address) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            withdrawal_contract,
        }
    }

    fn unclaimed_url(&self) -> RelayerResult<Url> {
        let mut url = self
            .base_url
            .join("api/l2/unclaimed/withdrawals")
            .map_err(|e| RelayerError::Config(format!("bridge api url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("address", &format!("{:?}", self.withdrawal_contract))
            .append_pair("page_size", &PAGE_SIZE.to_string())
            .append_pair("page", &FIRST_PAGE.to_string());
        Ok(url)
    }
}

#[async_trait]
impl ClaimableMessageSource for HttpBridgeApi {
    async fn claimable_messages(&self) -> RelayerResult<Vec<ClaimableMessage>> {
        let response = self
            .client
            .get(self.unclaimed_url()?)
            .send()
            .await?
            .error_for_status()?;
        let body = response.json::<serde_json::Value>().await?;
        parse_claimable(body)
    }
}

/// Keeps only the entries whose claim info says they are claimable.
fn parse_claimable(body: serde_json::Value) -> RelayerResult<Vec<ClaimableMessage>> {
    let response: UnclaimedResponse = serde_json::from_value(body)?;
    let results = response.data.map(|d| d.results).unwrap_or_default();
    results
        .into_iter()
        .filter_map(|r| r.claim_info)
        .filter(|info| info.claimable)
        .map(ClaimableMessage::try_from)
        .collect()
}

impl TryFrom<ClaimInfo> for ClaimableMessage {
    type Error = RelayerError;

    fn try_from(info: ClaimInfo) -> Result<Self, Self::Error> {
        Ok(ClaimableMessage {
            from: parse_field("from", &info.from)?,
            to: parse_field("to", &info.to)?,
            value: parse_decimal("value", &info.value)?,
            nonce: parse_decimal("nonce", &info.nonce)?,
            message: parse_field("message", &info.message)?,
            batch_index: parse_decimal("batch_index", &info.proof.batch_index)?,
            merkle_proof: parse_field("merkle_proof", &info.proof.merkle_proof)?,
        })
    }
}

fn parse_field<T>(name: &str, value: &str) -> RelayerResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| RelayerError::Decode(format!("claim_info.{} '{}': {}", name, value, e)))
}

fn parse_decimal(name: &str, value: &str) -> RelayerResult<U256> {
    U256::from_dec_str(value.trim())
        .map_err(|e| RelayerError::Decode(format!("claim_info.{} '{}': {}", name, value, e)))
}
