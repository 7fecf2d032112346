// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayerError, RelayerResult};

/// Progress key: last block whose `Deposited` events were analyzed.
pub const DEPOSITS_EVENT: &str = "Deposits";
/// Progress key: block of the last `DepositsAnalyzedAndRelayed` emitted for us.
pub const DEPOSITS_ANALYZED_AND_RELAYED_EVENT: &str = "DepositsAnalyzedAndRelayed";
/// Progress key: block of the last `DepositsAnalyzed` event (two-step contracts).
pub const DEPOSITS_ANALYZED_EVENT: &str = "DepositsAnalyzed";
/// Progress key: block of the last `DepositsRelayed` event (two-step contracts).
pub const DEPOSITS_RELAYED_EVENT: &str = "DepositsRelayed";
/// Progress key: last base-chain block whose `SentMessage` events were relayed.
pub const SENT_MESSAGE_EVENT: &str = "SentMessage";

pub const L2_BLOCK_NUMBER_JOB_PREFIX: &str = "l2_block_number_";
pub const L2_BATCH_INDEX_JOB_PREFIX: &str = "l2_batch_index_";

const L2_BLOCK_NUMBER_KEY: &str = "l2_block_number";
const BATCH_INDEX_KEY: &str = "batch_index";

/// The two chains never share block numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainKind {
    Base,
    Rollup,
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainKind::Base => write!(f, "base"),
            ChainKind::Rollup => write!(f, "rollup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventProgress {
    pub event_name: String,
    pub last_processed_block: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingJob {
    pub name: String,
    pub options: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    /// Reads a numeric option. Producers write numbers as decimal strings, plain JSON numbers
    /// are accepted too.
    pub fn option_u64(&self, key: &str) -> RelayerResult<u64> {
        let value = self.options.get(key).ok_or_else(|| {
            RelayerError::Payload(format!("job '{}' has no '{}' option", self.name, key))
        })?;
        match value {
            serde_json::Value::String(s) => s.trim().parse::<u64>().map_err(|e| {
                RelayerError::Payload(format!("job '{}' option '{}': {}", self.name, key, e))
            }),
            serde_json::Value::Number(n) => n.as_u64().ok_or_else(|| {
                RelayerError::Payload(format!(
                    "job '{}' option '{}' is not an unsigned integer",
                    self.name, key
                ))
            }),
            other => Err(RelayerError::Payload(format!(
                "job '{}' option '{}' has unexpected value {}",
                self.name, key, other
            ))),
        }
    }
}

/// Name and payload of the job that resolves an L2 block to its batch.
pub fn l2_block_number_job(block_number: u64) -> (String, serde_json::Value) {
    (
        format!("{L2_BLOCK_NUMBER_JOB_PREFIX}{block_number}"),
        serde_json::json!({ L2_BLOCK_NUMBER_KEY: block_number.to_string() }),
    )
}

/// Name and payload of the job that waits for a batch to be finalized on the base chain.
pub fn l2_batch_index_job(batch_index: u64) -> (String, serde_json::Value) {
    (
        format!("{L2_BATCH_INDEX_JOB_PREFIX}{batch_index}"),
        serde_json::json!({ BATCH_INDEX_KEY: batch_index.to_string() }),
    )
}

pub fn job_l2_block_number(job: &ProcessingJob) -> RelayerResult<u64> {
    job.option_u64(L2_BLOCK_NUMBER_KEY)
}

pub fn job_batch_index(job: &ProcessingJob) -> RelayerResult<u64> {
    job.option_u64(BATCH_INDEX_KEY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Submitted,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Submitted => "submitted",
            ItemStatus::Failed => "failed",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "submitted" => Ok(ItemStatus::Submitted),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(RelayerError::Decode(format!("item status '{other}'"))),
        }
    }
}

/// Work awaiting relay, identified by `(family, id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSubmissionItem {
    pub family: String,
    pub id: String,
    pub payload: serde_json::Value,
    pub status: ItemStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct L2BatchIndex {
    pub batch_index: u64,
    pub options: Option<serde_json::Value>,
    pub l1_verified_batch_tx_hash: Option<String>,
}
