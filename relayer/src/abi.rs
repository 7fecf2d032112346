// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Contract bindings for the events and functions the relayer touches.

use ethers::contract::abigen;

abigen!(
    Liquidity,
    r#"[
        event Deposited(uint256 indexed depositId, address indexed sender, bytes32 indexed recipientSaltHash, uint32 tokenIndex, uint256 amount, uint256 requestedAt)
        event DepositsAnalyzedAndRelayed(uint256 indexed upToDepositId, uint256[] rejectedIndices, uint256 gasLimit, bytes message)
        event DepositsAnalyzed(uint256 indexed lastAnalyzedDepositId, uint256[] rejectedIndices)
        event DepositsRelayed(uint256 indexed lastRelayedDepositId, uint256 gasLimit, bytes message)
        function analyzeAndRelayDeposits(uint256 upToDepositId, uint256[] rejectDepositIds, uint256 gasLimit) payable
        function analyzeDeposits(uint256 upToDepositId, uint256[] rejectDepositIds)
        function relayDeposits(uint256 maxLastSeenDepositIndex, uint256 gasLimit) payable
    ]"#,
);

abigen!(
    L1ScrollMessenger,
    r#"[
        struct L2MessageProof { uint256 batchIndex; bytes merkleProof; }
        event SentMessage(address indexed sender, address indexed target, uint256 value, uint256 messageNonce, uint256 gasLimit, bytes message)
        function relayMessageWithProof(address from, address to, uint256 value, uint256 nonce, bytes message, L2MessageProof proof)
    ]"#,
);

abigen!(
    L2ScrollMessenger,
    r#"[
        function relayMessage(address from, address to, uint256 value, uint256 nonce, bytes message)
    ]"#,
);

abigen!(
    Withdrawal,
    r#"[
        struct ChainedWithdrawal { address recipient; uint32 tokenIndex; uint256 amount; bytes32 nullifier; bytes32 blockHash; uint32 blockNumber; }
        struct WithdrawalProofPublicInputs { bytes32 lastWithdrawalHash; address withdrawalAggregator; }
        function submitWithdrawalProof(ChainedWithdrawal[] withdrawals, WithdrawalProofPublicInputs publicInputs, bytes proof)
    ]"#,
);
