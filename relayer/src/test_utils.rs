// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};

use crate::bridge_api::{ClaimableMessage, ClaimableMessageSource};
use crate::error::{RelayerError, RelayerResult};
use crate::event_source::{
    ChainEvent, ChainEventData, ChainEventSource, EventBatch, EventKind, SentMessage,
};
use crate::explorer::{BatchInfo, RollupExplorer};
use crate::prover::{PendingWithdrawal, WithdrawalProofProvider};
use crate::transactor::{
    L1MessengerTransactor, L2MessengerTransactor, LiquidityTransactor, TxReceiptInfo,
    WithdrawalProof, WithdrawalRequest, WithdrawalTransactor,
};
use crate::types::ChainKind;

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn guard<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

// ==================== Chain events ====================

/// Event source over a fixed set of logs. Blocks without an explicit time are treated as
/// produced just now.
pub struct MockEventSource {
    chain: ChainKind,
    head: AtomicU64,
    events: Mutex<Vec<(Address, ChainEvent)>>,
    block_times: Mutex<BTreeMap<u64, DateTime<Utc>>>,
    failures: Mutex<VecDeque<RelayerError>>,
    filters: Mutex<Vec<(EventKind, u64, Option<u64>)>>,
}

impl MockEventSource {
    pub fn new(chain: ChainKind, head: u64) -> Self {
        Self {
            chain,
            head: AtomicU64::new(head),
            events: Mutex::new(vec![]),
            block_times: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(VecDeque::new()),
            filters: Mutex::new(vec![]),
        }
    }

    pub fn add_event(&self, contract: Address, event: ChainEvent) {
        guard(&self.events).push((contract, event));
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn set_block_time(&self, block_number: u64, time: DateTime<Utc>) {
        guard(&self.block_times).insert(block_number, time);
    }

    /// The next `filter` call fails with `err`.
    pub fn fail_next(&self, err: RelayerError) {
        guard(&self.failures).push_back(err);
    }

    /// `(kind, from, to)` of every filter call so far.
    pub fn filter_calls(&self) -> Vec<(EventKind, u64, Option<u64>)> {
        guard(&self.filters).clone()
    }
}

#[async_trait]
impl ChainEventSource for MockEventSource {
    fn chain(&self) -> ChainKind {
        self.chain
    }

    async fn block_number(&self) -> RelayerResult<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block_timestamp(&self, block_number: u64) -> RelayerResult<DateTime<Utc>> {
        Ok(guard(&self.block_times)
            .get(&block_number)
            .copied()
            .unwrap_or_else(Utc::now))
    }

    async fn filter(
        &self,
        contract: Address,
        kind: EventKind,
        from_block: u64,
        to_block: Option<u64>,
    ) -> RelayerResult<EventBatch> {
        guard(&self.filters).push((kind, from_block, to_block));
        if let Some(err) = guard(&self.failures).pop_front() {
            return Err(err);
        }
        let to = to_block.unwrap_or_else(|| self.head.load(Ordering::SeqCst));
        if from_block > to {
            return Ok(EventBatch::default());
        }
        let mut events: Vec<ChainEvent> = guard(&self.events)
            .iter()
            .filter(|(address, event)| {
                *address == contract
                    && event.data.kind() == kind
                    && (from_block..=to).contains(&event.block_number)
            })
            .map(|(_, event)| event.clone())
            .collect();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(EventBatch {
            events,
            max_block_seen: Some(to),
        })
    }

    async fn find_deposit(
        &self,
        contract: Address,
        deposit_id: U256,
    ) -> RelayerResult<Option<ChainEvent>> {
        if let Some(err) = guard(&self.failures).pop_front() {
            return Err(err);
        }
        Ok(guard(&self.events)
            .iter()
            .find(|(address, event)| {
                *address == contract
                    && event.data.kind() == EventKind::Deposited
                    && event.data.deposit_id() == Some(deposit_id)
            })
            .map(|(_, event)| event.clone()))
    }
}

fn event(block_number: u64, data: ChainEventData) -> ChainEvent {
    ChainEvent {
        block_number,
        tx_hash: H256::from_low_u64_be(block_number),
        log_index: 0,
        data,
    }
}

pub fn deposited_event(deposit_id: u64, block_number: u64) -> ChainEvent {
    event(
        block_number,
        ChainEventData::Deposited {
            deposit_id: U256::from(deposit_id),
            sender: Address::repeat_byte(0x11),
            recipient_salt_hash: H256::repeat_byte(0x22),
            token_index: 0,
            amount: U256::exp10(18),
            requested_at: U256::from(1_700_000_000u64),
        },
    )
}

pub fn analyzed_and_relayed_event(up_to_deposit_id: u64, block_number: u64) -> ChainEvent {
    event(
        block_number,
        ChainEventData::DepositsAnalyzedAndRelayed {
            up_to_deposit_id: U256::from(up_to_deposit_id),
            rejected_indices: vec![],
            gas_limit: U256::from(1_000_000u64),
            message: Bytes::default(),
        },
    )
}

pub fn deposits_analyzed_event(last_analyzed_deposit_id: u64, block_number: u64) -> ChainEvent {
    event(
        block_number,
        ChainEventData::DepositsAnalyzed {
            last_analyzed_deposit_id: U256::from(last_analyzed_deposit_id),
            rejected_indices: vec![],
        },
    )
}

pub fn deposits_relayed_event(last_relayed_deposit_id: u64, block_number: u64) -> ChainEvent {
    event(
        block_number,
        ChainEventData::DepositsRelayed {
            last_relayed_deposit_id: U256::from(last_relayed_deposit_id),
            gas_limit: U256::from(1_000_000u64),
            message: Bytes::default(),
        },
    )
}

pub fn sent_message(nonce: u64) -> SentMessage {
    SentMessage {
        sender: Address::repeat_byte(0x01),
        target: Address::repeat_byte(0x02),
        value: U256::zero(),
        message_nonce: U256::from(nonce),
        gas_limit: U256::from(1_000_000u64),
        message: Bytes::from(vec![0xca, 0xfe]),
    }
}

pub fn sent_message_event(nonce: u64, block_number: u64) -> ChainEvent {
    event(block_number, ChainEventData::SentMessage(sent_message(nonce)))
}

// ==================== Transactors ====================

pub fn receipt(block_number: u64) -> TxReceiptInfo {
    TxReceiptInfo {
        tx_hash: H256::from_low_u64_be(block_number),
        block_number,
    }
}

pub fn reverted(reason: &str) -> RelayerError {
    RelayerError::Reverted {
        tx_hash: Some(H256::repeat_byte(0xee)),
        reason: reason.to_string(),
    }
}

/// Queued results first, then a successful receipt in `receipt_block`.
pub struct ScriptedReceipts {
    results: Mutex<VecDeque<RelayerResult<TxReceiptInfo>>>,
    receipt_block: u64,
}

impl ScriptedReceipts {
    pub fn new(receipt_block: u64) -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            receipt_block,
        }
    }

    pub fn push(&self, result: RelayerResult<TxReceiptInfo>) {
        guard(&self.results).push_back(result);
    }

    fn next(&self) -> RelayerResult<TxReceiptInfo> {
        guard(&self.results)
            .pop_front()
            .unwrap_or_else(|| Ok(receipt(self.receipt_block)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiquidityCall {
    AnalyzeAndRelay {
        up_to: U256,
        rejected: Vec<U256>,
        gas_limit: U256,
    },
    Analyze {
        up_to: U256,
        rejected: Vec<U256>,
    },
    Relay {
        up_to: U256,
        gas_limit: U256,
    },
}

pub struct MockLiquidityTransactor {
    pub receipts: ScriptedReceipts,
    calls: Mutex<Vec<LiquidityCall>>,
}

impl MockLiquidityTransactor {
    pub fn new(receipt_block: u64) -> Self {
        Self {
            receipts: ScriptedReceipts::new(receipt_block),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn calls(&self) -> Vec<LiquidityCall> {
        guard(&self.calls).clone()
    }
}

#[async_trait]
impl LiquidityTransactor for MockLiquidityTransactor {
    async fn analyze_and_relay_deposits(
        &self,
        up_to_deposit_id: U256,
        reject_deposit_ids: Vec<U256>,
        gas_limit: U256,
    ) -> RelayerResult<TxReceiptInfo> {
        guard(&self.calls).push(LiquidityCall::AnalyzeAndRelay {
            up_to: up_to_deposit_id,
            rejected: reject_deposit_ids,
            gas_limit,
        });
        self.receipts.next()
    }

    async fn analyze_deposits(
        &self,
        up_to_deposit_id: U256,
        reject_deposit_ids: Vec<U256>,
    ) -> RelayerResult<TxReceiptInfo> {
        guard(&self.calls).push(LiquidityCall::Analyze {
            up_to: up_to_deposit_id,
            rejected: reject_deposit_ids,
        });
        self.receipts.next()
    }

    async fn relay_deposits(
        &self,
        max_last_seen_deposit_index: U256,
        gas_limit: U256,
    ) -> RelayerResult<TxReceiptInfo> {
        guard(&self.calls).push(LiquidityCall::Relay {
            up_to: max_last_seen_deposit_index,
            gas_limit,
        });
        self.receipts.next()
    }
}

pub struct MockWithdrawalTransactor {
    pub receipts: ScriptedReceipts,
    calls: Mutex<Vec<(Vec<WithdrawalRequest>, WithdrawalProof)>>,
}

impl MockWithdrawalTransactor {
    pub fn new(receipt_block: u64) -> Self {
        Self {
            receipts: ScriptedReceipts::new(receipt_block),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn calls(&self) -> Vec<(Vec<WithdrawalRequest>, WithdrawalProof)> {
        guard(&self.calls).clone()
    }
}

#[async_trait]
impl WithdrawalTransactor for MockWithdrawalTransactor {
    async fn submit_withdrawal_proof(
        &self,
        withdrawals: &[WithdrawalRequest],
        proof: &WithdrawalProof,
    ) -> RelayerResult<TxReceiptInfo> {
        guard(&self.calls).push((withdrawals.to_vec(), proof.clone()));
        self.receipts.next()
    }
}

pub struct MockL2Messenger {
    pub receipts: ScriptedReceipts,
    relayed: Mutex<Vec<SentMessage>>,
}

impl MockL2Messenger {
    pub fn new(receipt_block: u64) -> Self {
        Self {
            receipts: ScriptedReceipts::new(receipt_block),
            relayed: Mutex::new(vec![]),
        }
    }

    pub fn relayed(&self) -> Vec<SentMessage> {
        guard(&self.relayed).clone()
    }
}

#[async_trait]
impl L2MessengerTransactor for MockL2Messenger {
    async fn relay_message(&self, message: &SentMessage) -> RelayerResult<TxReceiptInfo> {
        guard(&self.relayed).push(message.clone());
        self.receipts.next()
    }
}

pub struct MockL1Messenger {
    pub receipts: ScriptedReceipts,
    relayed: Mutex<Vec<ClaimableMessage>>,
}

impl MockL1Messenger {
    pub fn new(receipt_block: u64) -> Self {
        Self {
            receipts: ScriptedReceipts::new(receipt_block),
            relayed: Mutex::new(vec![]),
        }
    }

    pub fn relayed(&self) -> Vec<ClaimableMessage> {
        guard(&self.relayed).clone()
    }
}

#[async_trait]
impl L1MessengerTransactor for MockL1Messenger {
    async fn relay_message_with_proof(
        &self,
        message: &ClaimableMessage,
    ) -> RelayerResult<TxReceiptInfo> {
        guard(&self.relayed).push(message.clone());
        self.receipts.next()
    }
}

// ==================== HTTP collaborators ====================

#[derive(Default)]
pub struct MockExplorer {
    block_batches: Mutex<HashMap<u64, u64>>,
    batches: Mutex<HashMap<u64, BatchInfo>>,
}

impl MockExplorer {
    pub fn set_batch_of_block(&self, l2_block_number: u64, batch_index: u64) {
        guard(&self.block_batches).insert(l2_block_number, batch_index);
    }

    pub fn set_batch(&self, batch_index: u64, finalize_tx_hash: Option<&str>) {
        let raw = serde_json::json!({
            "batch": {
                "index": batch_index,
                "finalize_tx_hash": finalize_tx_hash.unwrap_or_default(),
            }
        });
        guard(&self.batches).insert(
            batch_index,
            BatchInfo {
                finalize_tx_hash: finalize_tx_hash.map(str::to_string),
                raw,
            },
        );
    }
}

#[async_trait]
impl RollupExplorer for MockExplorer {
    async fn batch_index_of_block(&self, l2_block_number: u64) -> RelayerResult<Option<u64>> {
        Ok(guard(&self.block_batches).get(&l2_block_number).copied())
    }

    async fn batch_info(&self, batch_index: u64) -> RelayerResult<Option<BatchInfo>> {
        Ok(guard(&self.batches).get(&batch_index).cloned())
    }
}

#[derive(Default)]
pub struct MockBridgeApi {
    messages: Mutex<Vec<ClaimableMessage>>,
}

impl MockBridgeApi {
    pub fn set_messages(&self, messages: Vec<ClaimableMessage>) {
        *guard(&self.messages) = messages;
    }
}

#[async_trait]
impl ClaimableMessageSource for MockBridgeApi {
    async fn claimable_messages(&self) -> RelayerResult<Vec<ClaimableMessage>> {
        Ok(guard(&self.messages).clone())
    }
}

pub fn claimable_message(nonce: u64) -> ClaimableMessage {
    ClaimableMessage {
        from: Address::repeat_byte(0x0a),
        to: Address::repeat_byte(0x0b),
        value: U256::zero(),
        nonce: U256::from(nonce),
        message: Bytes::from(vec![0x01]),
        batch_index: U256::from(3),
        merkle_proof: Bytes::from(vec![0x02; 32]),
    }
}

/// Returns `proof` once set; until then the prover is "still working".
#[derive(Default)]
pub struct MockProver {
    proof: Mutex<Option<Bytes>>,
    requests: Mutex<Vec<(String, usize)>>,
}

impl MockProver {
    pub fn ready(proof: Bytes) -> Self {
        Self {
            proof: Mutex::new(Some(proof)),
            requests: Mutex::new(vec![]),
        }
    }

    /// `(request_id, withdrawal count)` of every request so far.
    pub fn requests(&self) -> Vec<(String, usize)> {
        guard(&self.requests).clone()
    }
}

#[async_trait]
impl WithdrawalProofProvider for MockProver {
    async fn prove(
        &self,
        request_id: &str,
        withdrawals: &[PendingWithdrawal],
        _aggregator: Address,
    ) -> RelayerResult<Option<Bytes>> {
        guard(&self.requests).push((request_id.to_string(), withdrawals.len()));
        Ok(guard(&self.proof).clone())
    }
}

pub fn withdrawal_request(seed: u8) -> WithdrawalRequest {
    WithdrawalRequest {
        recipient: Address::repeat_byte(seed),
        token_index: 0,
        amount: U256::from(1000u64) * U256::from(seed),
        nullifier: H256::repeat_byte(seed),
        block_hash: H256::repeat_byte(0xbb),
        block_number: 10,
    }
}
