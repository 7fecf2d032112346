// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::Parser;
use rollup_relayer::config::{Config, RelayerNodeConfig};
use rollup_relayer::node::{start_relayer_node, NodeArgs};
use rollup_relayer_pg_db::DbArgs;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version)]
struct Args {
    #[clap(long)]
    config_path: PathBuf,

    #[clap(long, env = "DATABASE_URL")]
    database_url: Url,

    #[clap(flatten)]
    db_args: DbArgs,

    /// Do not apply pending schema migrations at start-up.
    #[clap(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = RelayerNodeConfig::load(&args.config_path)?;
    info!("[Main] Loaded config from {:?}", args.config_path);

    let node = start_relayer_node(
        config,
        NodeArgs {
            database_url: args.database_url,
            db_args: args.db_args,
            skip_migrations: args.skip_migrations,
        },
    )
    .await?;
    info!("[Main] Relayer running families: {}", node.families().join(", "));

    tokio::signal::ctrl_c().await?;
    info!("[Main] Received ctrl-c, shutting down");
    node.shutdown().await
}
