// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Decides whether pending work is worth a transaction now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionPolicy {
    pub threshold: u64,
    pub max_wait: Duration,
}

impl SubmissionPolicy {
    pub const fn new(threshold: u64, max_wait: Duration) -> Self {
        Self {
            threshold,
            max_wait,
        }
    }

    pub const fn deposit_relayer() -> Self {
        Self::new(128, Duration::from_secs(60 * 60))
    }

    pub const fn withdrawal_aggregator() -> Self {
        Self::new(8, Duration::from_secs(15 * 60))
    }

    pub const fn deposit_analyzer() -> Self {
        Self::new(10, Duration::from_secs(10 * 60))
    }

    /// Relay as soon as anything is pending.
    pub const fn immediate() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// `oldest_age` is the age of the oldest pending item; it is ignored when nothing is
    /// pending.
    pub fn should_submit(&self, pending_count: u64, oldest_age: Duration) -> bool {
        if pending_count == 0 {
            return false;
        }
        pending_count >= self.threshold || oldest_age >= self.max_wait
    }
}
