// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use prometheus::Registry;
use rollup_relayer_pg_db::{Db, DbArgs};
use rollup_relayer_schema::MIGRATIONS;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::bridge_api::HttpBridgeApi;
use crate::config::{FamilyConfig, RelayerNodeConfig};
use crate::error::RelayerResult;
use crate::event_source::{ChainEventSource, EthEventSource};
use crate::explorer::{HttpRollupExplorer, RollupExplorer};
use crate::metrics::{start_metrics_server, RelayerMetrics};
use crate::prover::HttpWithdrawalProver;
use crate::scheduler::{BusinessStep, SyncScheduler};
use crate::steps::{
    DepositAnalyzerStep, DepositRelayerStep, L2BatchIndexStep, L2BlockNumberStep,
    MessengerRelayerStep, WithdrawalAggregatorStep, WithdrawalRelayerStep,
};
use crate::storage::pg::PgStore;
use crate::transactor::{
    build_signer, EthL1MessengerTransactor, EthL2MessengerTransactor, EthLiquidityTransactor,
    EthSigner, EthWithdrawalTransactor,
};
use crate::tx_executor::TransactionRetryExecutor;
use crate::types::ChainKind;

pub struct NodeArgs {
    pub database_url: Url,
    pub db_args: DbArgs,
    pub skip_migrations: bool,
}

/// Running schedulers and the metrics server.
pub struct RelayerNode {
    cancel: CancellationToken,
    schedulers: Vec<(String, JoinHandle<RelayerResult<()>>)>,
    metrics_server: JoinHandle<anyhow::Result<()>>,
}

impl RelayerNode {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn families(&self) -> Vec<&str> {
        self.schedulers.iter().map(|(f, _)| f.as_str()).collect()
    }

    /// Cancels every scheduler and waits for in-flight cycles to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("[Node] Shutting down {} schedulers", self.schedulers.len());
        self.cancel.cancel();
        let mut failed = vec![];
        for (family, handle) in self.schedulers {
            match handle.await {
                Ok(Ok(())) => info!("[Node] Scheduler {} stopped", family),
                Ok(Err(e)) => {
                    error!("[Node] Scheduler {} stopped with error: {}", family, e);
                    failed.push(family);
                }
                Err(e) => {
                    error!("[Node] Scheduler {} task failed: {}", family, e);
                    failed.push(family);
                }
            }
        }
        self.metrics_server.abort();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("schedulers failed: {}", failed.join(", ")))
        }
    }
}

struct Spawner {
    executor: TransactionRetryExecutor<PgStore>,
    metrics: Arc<RelayerMetrics>,
    cancel: CancellationToken,
    schedulers: Vec<(String, JoinHandle<RelayerResult<()>>)>,
}

impl Spawner {
    fn spawn<B: BusinessStep>(
        &mut self,
        config: &RelayerNodeConfig,
        family: &FamilyConfig,
        step: B,
    ) -> anyhow::Result<()> {
        let scheduler = SyncScheduler::new(
            Arc::new(step),
            self.executor.clone(),
            config.scheduler_config(family),
        )?
        .with_metrics(self.metrics.clone());
        let name = scheduler.family().to_string();
        info!("[Node] Starting {} scheduler", name);
        self.schedulers
            .push((name, scheduler.spawn(self.cancel.clone())));
        Ok(())
    }
}

fn required_url<'a>(name: &str, url: &'a Option<Url>) -> anyhow::Result<&'a Url> {
    url.as_ref()
        .ok_or_else(|| anyhow!("{} is not configured", name))
}

pub async fn start_relayer_node(
    config: RelayerNodeConfig,
    args: NodeArgs,
) -> anyhow::Result<RelayerNode> {
    config.validate()?;

    let registry = Registry::new();
    let metrics = Arc::new(RelayerMetrics::new(&registry)?);
    let metrics_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.metrics_port);
    let metrics_server = start_metrics_server(metrics_address, registry);

    let db = Db::for_write(args.database_url, args.db_args)
        .await
        .context("connecting to the relayer database")?;
    if args.skip_migrations {
        warn!("[Node] Skipping database migrations");
    } else {
        let applied = db.run_migrations(&MIGRATIONS).await?;
        info!("[Node] Applied {} migrations", applied.len());
    }
    let store = Arc::new(PgStore::new(db));
    let executor = TransactionRetryExecutor::from_config(store, &config.database)
        .with_metrics(metrics.clone());

    let base: Arc<dyn ChainEventSource> = Arc::new(
        EthEventSource::connect(
            ChainKind::Base,
            &config.base_chain.rpc_url,
            config.base_chain.chain_id,
        )
        .await?,
    );
    let rollup: Arc<dyn ChainEventSource> = Arc::new(
        EthEventSource::connect(
            ChainKind::Rollup,
            &config.rollup_chain.rpc_url,
            config.rollup_chain.chain_id,
        )
        .await?,
    );

    let families = &config.families;
    let base_signer: Option<Arc<EthSigner>> = match &config.base_chain.private_key {
        Some(key) => Some(
            build_signer(&config.base_chain.rpc_url, key, config.base_chain.chain_id).await?,
        ),
        None => None,
    };
    let rollup_signer: Option<Arc<EthSigner>> = match &config.rollup_chain.private_key {
        Some(key) => Some(
            build_signer(
                &config.rollup_chain.rpc_url,
                key,
                config.rollup_chain.chain_id,
            )
            .await?,
        ),
        None => None,
    };
    let require_base = || {
        base_signer
            .clone()
            .ok_or_else(|| anyhow!("base-chain private-key is not configured"))
    };
    let require_rollup = || {
        rollup_signer
            .clone()
            .ok_or_else(|| anyhow!("rollup-chain private-key is not configured"))
    };

    let cancel = CancellationToken::new();
    let mut spawner = Spawner {
        executor,
        metrics: metrics.clone(),
        cancel: cancel.clone(),
        schedulers: vec![],
    };

    let liquidity = config.base_chain.liquidity_address;
    if families.deposit_analyzer.enabled {
        let transactor = Arc::new(EthLiquidityTransactor::new(liquidity, require_base()?));
        let step = DepositAnalyzerStep::new(
            base.clone(),
            liquidity,
            transactor,
            families.deposit_analyzer.policy(),
        )
        .with_mode(families.analyzer_mode)
        .with_metrics(metrics.clone());
        spawner.spawn(&config, &families.deposit_analyzer, step)?;
    }
    if families.deposit_relayer.enabled {
        let transactor = Arc::new(EthLiquidityTransactor::new(liquidity, require_base()?));
        let step = DepositRelayerStep::new(
            base.clone(),
            liquidity,
            transactor,
            families.deposit_relayer.policy(),
        )
        .with_metrics(metrics.clone());
        spawner.spawn(&config, &families.deposit_relayer, step)?;
    }
    if families.withdrawal_aggregator.enabled {
        let prover_url = required_url("withdrawal-prover-url", &config.withdrawal_prover_url)?;
        let withdrawal = config.rollup_chain.withdrawal_address;
        let step = WithdrawalAggregatorStep::new(
            Arc::new(HttpWithdrawalProver::new(prover_url.clone())),
            Arc::new(EthWithdrawalTransactor::new(withdrawal, require_rollup()?)),
            withdrawal,
            families.withdrawal_aggregator.policy(),
        )
        .with_metrics(metrics.clone());
        spawner.spawn(&config, &families.withdrawal_aggregator, step)?;
    }
    if families.withdrawal_relayer.enabled {
        let api_url = required_url("bridge-api-url", &config.bridge_api_url)?;
        let step = WithdrawalRelayerStep::new(
            Arc::new(HttpBridgeApi::new(
                api_url.clone(),
                config.rollup_chain.withdrawal_address,
            )),
            Arc::new(EthL1MessengerTransactor::new(
                config.base_chain.l1_messenger_address,
                require_base()?,
            )),
            families.withdrawal_relayer.policy(),
        )
        .with_metrics(metrics.clone());
        spawner.spawn(&config, &families.withdrawal_relayer, step)?;
    }
    if families.messenger_relayer.enabled {
        let step = MessengerRelayerStep::new(
            base.clone(),
            config.base_chain.l1_messenger_address,
            Arc::new(EthL2MessengerTransactor::new(
                config.rollup_chain.l2_messenger_address,
                require_rollup()?,
            )),
            families.messenger_relayer.policy(),
        )
        .with_metrics(metrics.clone());
        spawner.spawn(&config, &families.messenger_relayer, step)?;
    }
    if families.l2_block_number.enabled || families.l2_batch_index.enabled {
        let explorer_url = required_url("rollup-explorer-url", &config.rollup_explorer_url)?;
        let explorer: Arc<dyn RollupExplorer> =
            Arc::new(HttpRollupExplorer::new(explorer_url.clone()));
        if families.l2_block_number.enabled {
            let step = L2BlockNumberStep::new(rollup.clone(), explorer.clone());
            spawner.spawn(&config, &families.l2_block_number, step)?;
        }
        if families.l2_batch_index.enabled {
            let step = L2BatchIndexStep::new(explorer);
            spawner.spawn(&config, &families.l2_batch_index, step)?;
        }
    }

    if spawner.schedulers.is_empty() {
        warn!("[Node] No family is enabled");
    }
    Ok(RelayerNode {
        cancel,
        schedulers: spawner.schedulers,
        metrics_server,
    })
}
