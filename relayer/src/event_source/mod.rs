// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed contract events from one chain.
//!
//! A [`ChainEventSource`] is bound to exactly one chain. The node builds one for the base
//! chain and one for the rollup chain; their block numbers are never compared.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::contract::EthEvent;
use ethers::types::{Address, Bytes, TxHash, H256, U256};

use crate::abi::{
    DepositedFilter, DepositsAnalyzedAndRelayedFilter, DepositsAnalyzedFilter,
    DepositsRelayedFilter, SentMessageFilter,
};
use crate::error::RelayerResult;
use crate::types::ChainKind;

mod eth;

pub use eth::EthEventSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Deposited,
    DepositsAnalyzedAndRelayed,
    DepositsAnalyzed,
    DepositsRelayed,
    SentMessage,
}

impl EventKind {
    /// Topic0 of the event.
    pub fn signature(&self) -> H256 {
        match self {
            EventKind::Deposited => DepositedFilter::signature(),
            EventKind::DepositsAnalyzedAndRelayed => DepositsAnalyzedAndRelayedFilter::signature(),
            EventKind::DepositsAnalyzed => DepositsAnalyzedFilter::signature(),
            EventKind::DepositsRelayed => DepositsRelayedFilter::signature(),
            EventKind::SentMessage => SentMessageFilter::signature(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub sender: Address,
    pub target: Address,
    pub value: U256,
    pub message_nonce: U256,
    pub gas_limit: U256,
    pub message: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEventData {
    Deposited {
        deposit_id: U256,
        sender: Address,
        recipient_salt_hash: H256,
        token_index: u32,
        amount: U256,
        requested_at: U256,
    },
    DepositsAnalyzedAndRelayed {
        up_to_deposit_id: U256,
        rejected_indices: Vec<U256>,
        gas_limit: U256,
        message: Bytes,
    },
    DepositsAnalyzed {
        last_analyzed_deposit_id: U256,
        rejected_indices: Vec<U256>,
    },
    DepositsRelayed {
        last_relayed_deposit_id: U256,
        gas_limit: U256,
        message: Bytes,
    },
    SentMessage(SentMessage),
}

impl ChainEventData {
    pub fn kind(&self) -> EventKind {
        match self {
            ChainEventData::Deposited { .. } => EventKind::Deposited,
            ChainEventData::DepositsAnalyzedAndRelayed { .. } => {
                EventKind::DepositsAnalyzedAndRelayed
            }
            ChainEventData::DepositsAnalyzed { .. } => EventKind::DepositsAnalyzed,
            ChainEventData::DepositsRelayed { .. } => EventKind::DepositsRelayed,
            ChainEventData::SentMessage(_) => EventKind::SentMessage,
        }
    }

    /// The deposit id an event refers to: the deposit itself, or the upper bound of an
    /// analyzed/relayed range.
    pub fn deposit_id(&self) -> Option<U256> {
        match self {
            ChainEventData::Deposited { deposit_id, .. } => Some(*deposit_id),
            ChainEventData::DepositsAnalyzedAndRelayed {
                up_to_deposit_id, ..
            } => Some(*up_to_deposit_id),
            ChainEventData::DepositsAnalyzed {
                last_analyzed_deposit_id,
                ..
            } => Some(*last_analyzed_deposit_id),
            ChainEventData::DepositsRelayed {
                last_relayed_deposit_id,
                ..
            } => Some(*last_relayed_deposit_id),
            ChainEventData::SentMessage(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub block_number: u64,
    pub tx_hash: TxHash,
    pub log_index: u64,
    pub data: ChainEventData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBatch {
    /// Ordered by block, then log index.
    pub events: Vec<ChainEvent>,
    /// Upper bound of the range that was scanned. `None` when the range was empty.
    pub max_block_seen: Option<u64>,
}

#[async_trait]
pub trait ChainEventSource: Send + Sync {
    fn chain(&self) -> ChainKind;

    /// Current chain head.
    async fn block_number(&self) -> RelayerResult<u64>;

    async fn block_timestamp(&self, block_number: u64) -> RelayerResult<DateTime<Utc>>;

    /// Events of `kind` emitted by `contract` in `[from_block, to_block]`. An open
    /// `to_block` scans up to the current head.
    async fn filter(
        &self,
        contract: Address,
        kind: EventKind,
        from_block: u64,
        to_block: Option<u64>,
    ) -> RelayerResult<EventBatch>;

    /// The `Deposited` event of `deposit_id`, looked up by its indexed id rather than by
    /// block range.
    async fn find_deposit(
        &self,
        contract: Address,
        deposit_id: U256,
    ) -> RelayerResult<Option<ChainEvent>>;
}

/// The last `kind` event at or after `from_block`.
///
/// Markers store the block of the last event we emitted; scanning from that block itself
/// (not the one after) keeps the event in view so its deposit id can be recovered.
pub async fn last_event_since(
    source: &dyn ChainEventSource,
    contract: Address,
    kind: EventKind,
    from_block: u64,
) -> RelayerResult<Option<ChainEvent>> {
    let batch = source.filter(contract, kind, from_block, None).await?;
    Ok(batch.events.into_iter().last())
}

/// How long ago `block_number` was produced. Clock skew never yields a negative age.
pub async fn block_age(
    source: &dyn ChainEventSource,
    block_number: u64,
) -> RelayerResult<Duration> {
    let produced_at = source.block_timestamp(block_number).await?;
    Ok((Utc::now() - produced_at).to_std().unwrap_or(Duration::ZERO))
}
