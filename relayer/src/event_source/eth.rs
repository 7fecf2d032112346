// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::abi::RawLog;
use ethers::contract::EthEvent;
use ethers::providers::{Http, JsonRpcClient, Middleware, Provider};
use ethers::types::{Address, BlockNumber, Filter, Log, H256, U256};
use tap::TapFallible;

use super::{ChainEvent, ChainEventData, ChainEventSource, EventBatch, EventKind, SentMessage};
use crate::abi::{
    DepositedFilter, DepositsAnalyzedAndRelayedFilter, DepositsAnalyzedFilter,
    DepositsRelayedFilter, SentMessageFilter,
};
use crate::error::{RelayerError, RelayerResult};
use crate::retry_with_max_elapsed_time;
use crate::types::ChainKind;

const DEFAULT_MAX_RETRY_DURATION: Duration = Duration::from_secs(30);

/// [`ChainEventSource`] over an ethers JSON-RPC provider.
pub struct EthEventSource<P> {
    chain: ChainKind,
    provider: Arc<Provider<P>>,
    max_retry_duration: Duration,
}

impl EthEventSource<Http> {
    /// Connects over HTTP and refuses to continue if the endpoint serves another chain.
    pub async fn connect(
        chain: ChainKind,
        rpc_url: &str,
        expected_chain_id: u64,
    ) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| anyhow::anyhow!("invalid {} rpc url {}: {}", chain, rpc_url, e))?;
        let source = Self::new(chain, Arc::new(provider));
        source.validate_chain_id(expected_chain_id).await?;
        Ok(source)
    }
}

impl<P> EthEventSource<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(chain: ChainKind, provider: Arc<Provider<P>>) -> Self {
        Self {
            chain,
            provider,
            max_retry_duration: DEFAULT_MAX_RETRY_DURATION,
        }
    }

    pub fn with_max_retry_duration(mut self, max_retry_duration: Duration) -> Self {
        self.max_retry_duration = max_retry_duration;
        self
    }

    pub fn provider(&self) -> Arc<Provider<P>> {
        self.provider.clone()
    }

    pub async fn validate_chain_id(&self, expected: u64) -> RelayerResult<()> {
        let chain_id = match retry_with_max_elapsed_time!(
            self.provider.get_chainid(),
            self.max_retry_duration
        ) {
            Ok(Ok(chain_id)) => chain_id.as_u64(),
            Ok(Err(e)) | Err(e) => return Err(e.into()),
        };
        if chain_id != expected {
            return Err(RelayerError::Config(format!(
                "{} chain id mismatch: expected {}, got {}",
                self.chain, expected, chain_id
            )));
        }
        tracing::info!(
            "[EventSource] Connected to {} chain {} (verified)",
            self.chain,
            chain_id
        );
        Ok(())
    }
}

#[async_trait]
impl<P> ChainEventSource for EthEventSource<P>
where
    P: JsonRpcClient + 'static,
{
    fn chain(&self) -> ChainKind {
        self.chain
    }

    async fn block_number(&self) -> RelayerResult<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn block_timestamp(&self, block_number: u64) -> RelayerResult<DateTime<Utc>> {
        let block = match retry_with_max_elapsed_time!(
            self.provider.get_block(block_number),
            self.max_retry_duration
        ) {
            Ok(Ok(block)) => block,
            Ok(Err(e)) | Err(e) => return Err(e.into()),
        };
        let block = block.ok_or_else(|| {
            RelayerError::Rpc(format!("{} block {} not found", self.chain, block_number))
        })?;
        u64::try_from(block.timestamp)
            .ok()
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| {
                RelayerError::Decode(format!(
                    "timestamp {} of block {}",
                    block.timestamp, block_number
                ))
            })
    }

    async fn filter(
        &self,
        contract: Address,
        kind: EventKind,
        from_block: u64,
        to_block: Option<u64>,
    ) -> RelayerResult<EventBatch> {
        let to_block = match to_block {
            Some(to_block) => to_block,
            None => self.block_number().await?,
        };
        if from_block > to_block {
            return Ok(EventBatch::default());
        }

        let filter = Filter::new()
            .address(contract)
            .topic0(kind.signature())
            .from_block(from_block)
            .to_block(to_block);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(RelayerError::from)
            .tap_err(|e| {
                tracing::error!(
                    "[EventSource] {} get_logs failed. Filter: {:?}. Error {:?}",
                    self.chain,
                    filter,
                    e
                )
            })?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if log.address != contract {
                return Err(RelayerError::Decode(format!(
                    "provider returned a log from {:?} for a filter on {:?}",
                    log.address, contract
                )));
            }
            events.push(to_chain_event(kind, &log)?);
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));

        Ok(EventBatch {
            events,
            max_block_seen: Some(to_block),
        })
    }

    async fn find_deposit(
        &self,
        contract: Address,
        deposit_id: U256,
    ) -> RelayerResult<Option<ChainEvent>> {
        let mut topic = [0u8; 32];
        deposit_id.to_big_endian(&mut topic);
        let filter = Filter::new()
            .address(contract)
            .topic0(EventKind::Deposited.signature())
            .topic1(H256::from(topic))
            .from_block(BlockNumber::Earliest)
            .to_block(BlockNumber::Latest);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(RelayerError::from)
            .tap_err(|e| {
                tracing::error!(
                    "[EventSource] {} deposit {} lookup failed: {:?}",
                    self.chain,
                    deposit_id,
                    e
                )
            })?;
        logs.iter()
            .find(|log| log.address == contract)
            .map(|log| to_chain_event(EventKind::Deposited, log))
            .transpose()
    }
}

fn to_chain_event(kind: EventKind, log: &Log) -> RelayerResult<ChainEvent> {
    let block_number = log
        .block_number
        .ok_or_else(|| RelayerError::Decode("log without block number".into()))?
        .as_u64();
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| RelayerError::Decode("log without transaction hash".into()))?;
    let log_index = log.log_index.map(|i| i.as_u64()).unwrap_or_default();
    Ok(ChainEvent {
        block_number,
        tx_hash,
        log_index,
        data: decode_log(kind, log)?,
    })
}

fn decode_log(kind: EventKind, log: &Log) -> RelayerResult<ChainEventData> {
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    let decode_err = |e: ethers::abi::Error| {
        RelayerError::Decode(format!(
            "{:?} log in tx {:?}: {}",
            kind, log.transaction_hash, e
        ))
    };
    let data = match kind {
        EventKind::Deposited => {
            let e = DepositedFilter::decode_log(&raw).map_err(decode_err)?;
            ChainEventData::Deposited {
                deposit_id: e.deposit_id,
                sender: e.sender,
                recipient_salt_hash: H256::from(e.recipient_salt_hash),
                token_index: e.token_index,
                amount: e.amount,
                requested_at: e.requested_at,
            }
        }
        EventKind::DepositsAnalyzedAndRelayed => {
            let e = DepositsAnalyzedAndRelayedFilter::decode_log(&raw).map_err(decode_err)?;
            ChainEventData::DepositsAnalyzedAndRelayed {
                up_to_deposit_id: e.up_to_deposit_id,
                rejected_indices: e.rejected_indices,
                gas_limit: e.gas_limit,
                message: e.message,
            }
        }
        EventKind::DepositsAnalyzed => {
            let e = DepositsAnalyzedFilter::decode_log(&raw).map_err(decode_err)?;
            ChainEventData::DepositsAnalyzed {
                last_analyzed_deposit_id: e.last_analyzed_deposit_id,
                rejected_indices: e.rejected_indices,
            }
        }
        EventKind::DepositsRelayed => {
            let e = DepositsRelayedFilter::decode_log(&raw).map_err(decode_err)?;
            ChainEventData::DepositsRelayed {
                last_relayed_deposit_id: e.last_relayed_deposit_id,
                gas_limit: e.gas_limit,
                message: e.message,
            }
        }
        EventKind::SentMessage => {
            let e = SentMessageFilter::decode_log(&raw).map_err(decode_err)?;
            ChainEventData::SentMessage(SentMessage {
                sender: e.sender,
                target: e.target,
                value: e.value,
                message_nonce: e.message_nonce,
                gas_limit: e.gas_limit,
                message: e.message,
            })
        }
    };
    Ok(data)
}
