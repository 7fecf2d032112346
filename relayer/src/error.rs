// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::types::TxHash;

/// How the scheduler reacts to an error coming out of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Serialization or deadlock failure; replaying the transaction may succeed.
    StorageTransient,
    /// Upstream not reachable or claim lost; try again on the next tick.
    NextTick,
    /// Not retried. Stops the family when its policy says so.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayerError {
    #[error("transient storage conflict: {0}")]
    StorageConflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("transaction {tx_hash:?} reverted: {reason}")]
    Reverted {
        tx_hash: Option<TxHash>,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to decode {0}")]
    Decode(String),

    #[error("malformed job payload: {0}")]
    Payload(String),

    #[error("lease '{0}' was claimed by another executor")]
    LeaseLost(String),

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<RelayerError>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type RelayerResult<T> = Result<T, RelayerError>;

impl RelayerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayerError::StorageConflict(_) => ErrorKind::StorageTransient,
            RelayerError::Rpc(_)
            | RelayerError::StorageUnavailable(_)
            | RelayerError::LeaseLost(_) => ErrorKind::NextTick,
            RelayerError::Storage(_)
            | RelayerError::Reverted { .. }
            | RelayerError::Config(_)
            | RelayerError::Decode(_)
            | RelayerError::Payload(_)
            | RelayerError::RetriesExhausted { .. }
            | RelayerError::Internal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_storage_conflict(&self) -> bool {
        self.kind() == ErrorKind::StorageTransient
    }

    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayerError::StorageConflict(_) => "storage_conflict",
            RelayerError::Storage(_) => "storage",
            RelayerError::StorageUnavailable(_) => "storage_unavailable",
            RelayerError::Rpc(_) => "rpc",
            RelayerError::Reverted { .. } => "reverted",
            RelayerError::Config(_) => "config",
            RelayerError::Decode(_) => "decode",
            RelayerError::Payload(_) => "payload",
            RelayerError::LeaseLost(_) => "lease_lost",
            RelayerError::RetriesExhausted { .. } => "retries_exhausted",
            RelayerError::Internal(_) => "internal",
        }
    }

    /// Revert reason carried by the error, if the chain gave one.
    pub fn revert_reason(&self) -> Option<&str> {
        match self {
            RelayerError::Reverted { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl From<diesel::result::Error> for RelayerError {
    fn from(err: diesel::result::Error) -> Self {
        if rollup_relayer_pg_db::is_transient_error(&err) {
            RelayerError::StorageConflict(err.to_string())
        } else if rollup_relayer_pg_db::is_connection_error(&err) {
            RelayerError::StorageUnavailable(err.to_string())
        } else {
            RelayerError::Storage(err.to_string())
        }
    }
}

impl From<ethers::providers::ProviderError> for RelayerError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        RelayerError::Rpc(err.to_string())
    }
}

impl From<reqwest::Error> for RelayerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RelayerError::Decode(err.to_string())
        } else {
            RelayerError::Rpc(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RelayerError {
    fn from(err: serde_json::Error) -> Self {
        RelayerError::Decode(err.to_string())
    }
}
