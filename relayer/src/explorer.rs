// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::error::{RelayerError, RelayerResult};

/// Explorer view of one rollup batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchInfo {
    /// Hash of the base-chain transaction that finalized the batch, if any.
    pub finalize_tx_hash: Option<String>,
    /// The explorer response as returned, stored alongside the batch.
    pub raw: serde_json::Value,
}

/// Rollup explorer lookups. `None` means the explorer does not know yet.
#[async_trait]
pub trait RollupExplorer: Send + Sync {
    async fn batch_index_of_block(&self, l2_block_number: u64) -> RelayerResult<Option<u64>>;

    async fn batch_info(&self, batch_index: u64) -> RelayerResult<Option<BatchInfo>>;
}

pub struct HttpRollupExplorer {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpRollupExplorer {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn endpoint(&self, path: &str, key: &str, value: u64) -> RelayerResult<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| RelayerError::Config(format!("rollup explorer url: {}", e)))?;
        url.query_pairs_mut().append_pair(key, &value.to_string());
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> RelayerResult<Option<serde_json::Value>> {
        let response = self
            .client
            .get(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            tracing::debug!(
                "[Explorer] {} answered {}, not ready yet",
                url,
                response.status()
            );
            return Ok(None);
        }
        Ok(Some(response.json::<serde_json::Value>().await?))
    }
}

#[async_trait]
impl RollupExplorer for HttpRollupExplorer {
    async fn batch_index_of_block(&self, l2_block_number: u64) -> RelayerResult<Option<u64>> {
        let url = self.endpoint("api/search", "keyword", l2_block_number)?;
        Ok(self
            .get_json(url)
            .await?
            .and_then(|body| parse_search_batch_index(&body)))
    }

    async fn batch_info(&self, batch_index: u64) -> RelayerResult<Option<BatchInfo>> {
        let url = self.endpoint("api/batch", "index", batch_index)?;
        Ok(self.get_json(url).await?.map(parse_batch_info))
    }
}

/// Positive `batch_index` of a search response. Zero, negative or missing means the block
/// is not batched yet.
pub fn parse_search_batch_index(body: &serde_json::Value) -> Option<u64> {
    let value = body.get("batch_index")?;
    let index = value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()))?;
    u64::try_from(index).ok().filter(|i| *i > 0)
}

pub fn parse_batch_info(body: serde_json::Value) -> BatchInfo {
    let finalize_tx_hash = body
        .get("batch")
        .and_then(|batch| batch.get("finalize_tx_hash"))
        .and_then(|hash| hash.as_str())
        .map(str::trim)
        .filter(|hash| !hash.is_empty())
        .map(str::to_string);
    BatchInfo {
        finalize_tx_hash,
        raw: body,
    }
}
