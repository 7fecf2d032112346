// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use ethers::types::Address;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::info;
use url::Url;

use crate::policy::SubmissionPolicy;
use crate::scheduler::SchedulerConfig;
use crate::steps::{
    AnalyzerMode, DEPOSIT_ANALYZER_FAMILY, DEPOSIT_RELAYER_FAMILY, L2_BATCH_INDEX_FAMILY,
    L2_BLOCK_NUMBER_FAMILY, MESSENGER_RELAYER_FAMILY, WITHDRAWAL_AGGREGATOR_FAMILY,
    WITHDRAWAL_RELAYER_FAMILY,
};

/// Load/save for node configuration files. `.yaml`/`.yml` files are YAML, anything else is
/// JSON.
pub trait Config: Serialize + DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        let config = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("parsing YAML config {:?}", path))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("parsing JSON config {:?}", path))?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content).with_context(|| format!("writing config {:?}", path))?;
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BaseChainConfig {
    // Rpc url of the base chain node.
    pub rpc_url: String,
    // Expected chain id, checked at start-up.
    pub chain_id: u64,
    // Hex key used to sign base-chain transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub liquidity_address: Address,
    pub l1_messenger_address: Address,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RollupChainConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub l2_messenger_address: Address,
    // Also the withdrawal aggregator bound into proofs.
    pub withdrawal_address: Address,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
    #[serde(default = "default_commit_attempts_number")]
    pub commit_attempts_number: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_commit_timeout")]
    pub commit_timeout: Duration,
}

fn default_commit_attempts_number() -> u32 {
    3
}

fn default_commit_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            commit_attempts_number: default_commit_attempts_number(),
            commit_timeout: default_commit_timeout(),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerTimingConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_tick_interval")]
    pub tick_interval: Duration,
    // How long a claimed lease stays invisible to other executors.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: Duration,
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(600)
}

impl Default for SchedulerTimingConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            lease_ttl: default_lease_ttl(),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FamilyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub threshold: u64,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_wait: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_retry_after")]
    pub retry_after: Duration,
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
}

fn default_true() -> bool {
    true
}

fn default_retry_after() -> Duration {
    Duration::from_secs(10)
}

impl FamilyConfig {
    fn from_policy(enabled: bool, policy: SubmissionPolicy) -> Self {
        Self {
            enabled,
            threshold: policy.threshold,
            max_wait: policy.max_wait,
            retry_after: default_retry_after(),
            stop_on_error: true,
        }
    }

    pub fn policy(&self) -> SubmissionPolicy {
        SubmissionPolicy::new(self.threshold, self.max_wait)
    }
}

macro_rules! family_default {
    ($name:ident, $enabled:expr, $policy:expr) => {
        fn $name() -> FamilyConfig {
            FamilyConfig::from_policy($enabled, $policy)
        }
    };
}

family_default!(default_deposit_analyzer, true, SubmissionPolicy::deposit_analyzer());
family_default!(default_deposit_relayer, false, SubmissionPolicy::deposit_relayer());
family_default!(
    default_withdrawal_aggregator,
    false,
    SubmissionPolicy::withdrawal_aggregator()
);
family_default!(default_withdrawal_relayer, false, SubmissionPolicy::immediate());
family_default!(default_messenger_relayer, true, SubmissionPolicy::immediate());
family_default!(default_l2_indexer, false, SubmissionPolicy::immediate());

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FamiliesConfig {
    #[serde(default = "default_deposit_analyzer")]
    pub deposit_analyzer: FamilyConfig,
    #[serde(default)]
    pub analyzer_mode: AnalyzerMode,
    // Only meaningful with `analyzer-mode: analyze-only`.
    #[serde(default = "default_deposit_relayer")]
    pub deposit_relayer: FamilyConfig,
    #[serde(default = "default_withdrawal_aggregator")]
    pub withdrawal_aggregator: FamilyConfig,
    #[serde(default = "default_withdrawal_relayer")]
    pub withdrawal_relayer: FamilyConfig,
    #[serde(default = "default_messenger_relayer")]
    pub messenger_relayer: FamilyConfig,
    #[serde(default = "default_l2_indexer")]
    pub l2_block_number: FamilyConfig,
    #[serde(default = "default_l2_indexer")]
    pub l2_batch_index: FamilyConfig,
}

impl Default for FamiliesConfig {
    fn default() -> Self {
        Self {
            deposit_analyzer: default_deposit_analyzer(),
            analyzer_mode: AnalyzerMode::default(),
            deposit_relayer: default_deposit_relayer(),
            withdrawal_aggregator: default_withdrawal_aggregator(),
            withdrawal_relayer: default_withdrawal_relayer(),
            messenger_relayer: default_messenger_relayer(),
            l2_block_number: default_l2_indexer(),
            l2_batch_index: default_l2_indexer(),
        }
    }
}

impl FamiliesConfig {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FamilyConfig)> {
        [
            (DEPOSIT_ANALYZER_FAMILY, &self.deposit_analyzer),
            (DEPOSIT_RELAYER_FAMILY, &self.deposit_relayer),
            (WITHDRAWAL_AGGREGATOR_FAMILY, &self.withdrawal_aggregator),
            (WITHDRAWAL_RELAYER_FAMILY, &self.withdrawal_relayer),
            (MESSENGER_RELAYER_FAMILY, &self.messenger_relayer),
            (L2_BLOCK_NUMBER_FAMILY, &self.l2_block_number),
            (L2_BATCH_INDEX_FAMILY, &self.l2_batch_index),
        ]
        .into_iter()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayerNodeConfig {
    pub base_chain: BaseChainConfig,
    pub rollup_chain: RollupChainConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerTimingConfig,
    #[serde(default)]
    pub families: FamiliesConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollup_explorer_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_api_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawal_prover_url: Option<Url>,
    // The port for the metrics server.
    pub metrics_port: u16,
}

impl Config for RelayerNodeConfig {}

impl RelayerNodeConfig {
    /// Scheduler settings for one family.
    pub fn scheduler_config(&self, family: &FamilyConfig) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: self.scheduler.tick_interval,
            lease_ttl: self.scheduler.lease_ttl,
            retry_after: family.retry_after,
            stop_on_error: family.stop_on_error,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        info!("[Config] Validating relayer configuration");
        for (chain, rpc_url) in [
            ("base-chain", &self.base_chain.rpc_url),
            ("rollup-chain", &self.rollup_chain.rpc_url),
        ] {
            Url::parse(rpc_url).with_context(|| format!("{} rpc-url '{}'", chain, rpc_url))?;
        }
        if self.base_chain.chain_id == self.rollup_chain.chain_id {
            bail!(
                "base-chain and rollup-chain share chain id {}",
                self.base_chain.chain_id
            );
        }
        if self.scheduler.tick_interval.is_zero() || self.scheduler.lease_ttl.is_zero() {
            bail!("scheduler tick-interval and lease-ttl must be positive");
        }
        if self.scheduler.lease_ttl <= self.scheduler.tick_interval {
            bail!(
                "scheduler lease-ttl ({:?}) must exceed tick-interval ({:?})",
                self.scheduler.lease_ttl,
                self.scheduler.tick_interval
            );
        }

        for (name, family) in self.families.iter().filter(|(_, f)| f.enabled) {
            if family.threshold == 0 {
                bail!("family {} has threshold 0", name);
            }
        }

        let families = &self.families;
        let base_signs = families.deposit_analyzer.enabled
            || families.deposit_relayer.enabled
            || families.withdrawal_relayer.enabled;
        if base_signs && self.base_chain.private_key.is_none() {
            bail!("base-chain private-key is required by the enabled base-chain families");
        }
        let rollup_signs =
            families.messenger_relayer.enabled || families.withdrawal_aggregator.enabled;
        if rollup_signs && self.rollup_chain.private_key.is_none() {
            bail!("rollup-chain private-key is required by the enabled rollup-chain families");
        }
        if families.deposit_relayer.enabled && families.analyzer_mode != AnalyzerMode::AnalyzeOnly
        {
            bail!("deposit_relayer requires analyzer-mode analyze-only");
        }
        if families.withdrawal_relayer.enabled && self.bridge_api_url.is_none() {
            bail!("withdrawal_relayer requires bridge-api-url");
        }
        if families.withdrawal_aggregator.enabled && self.withdrawal_prover_url.is_none() {
            bail!("withdrawal_aggregator requires withdrawal-prover-url");
        }
        if (families.l2_block_number.enabled || families.l2_batch_index.enabled)
            && self.rollup_explorer_url.is_none()
        {
            bail!("l2 batch indexing requires rollup-explorer-url");
        }
        Ok(())
    }
}
