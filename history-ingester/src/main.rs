// This file is part of invest-ingester.
// Copyright (C) 2025 invest-ingester contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::{Parser, Subcommand};
use history_ingester::{
    application,
    config::Config,
    domain::AssetType,
    infra::{
        api::{history::HistoryClient, instruments::InstrumentsClient},
        storage::Storage,
    },
};
use ingester_common::{config::ConfigExt, telemetry};
use log::{error, info};
use secrecy::SecretString;
use std::{env, panic, process, time::Instant};

const INVEST_TOKEN_ENV_VAR: &str = "INVEST_TOKEN";

/// Batch ingester for instrument metadata and candle history.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database, its schema and the static asset type rows.
    Deploy,

    /// Download instrument metadata for all asset types and upsert it.
    UpdateInstruments,

    /// Download missing candle history; without FIGIs, for all known instruments.
    DownloadHistory { figis: Vec<String> },
}

#[tokio::main]
async fn main() {
    telemetry::init_logging();
    panic::set_hook(Box::new(|panic| error!(panic:%; "process panicked")));

    if let Err(error) = run().await {
        let backtrace = error.backtrace();
        let error = format!("{error:#}");
        error!(error, backtrace:%; "process exited with ERROR");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("load configuration")?;
    let started_at = Instant::now();

    match cli.command {
        Command::Deploy => {
            Storage::deploy(config.storage_config, &AssetType::ALL)
                .await
                .context("deploy database")?;
            info!(elapsed:? = started_at.elapsed(); "database deployed");
        }

        Command::UpdateInstruments => {
            let storage = Storage::connect(config.storage_config)
                .await
                .context("connect to database")?;
            let instruments = InstrumentsClient::new(
                config.api_config,
                invest_token()?,
                reqwest::Client::new(),
            );

            application::update_instruments(instruments, storage).await?;
        }

        Command::DownloadHistory { figis } => {
            let storage = Storage::connect(config.storage_config)
                .await
                .context("connect to database")?;
            let archives =
                HistoryClient::new(config.api_config, invest_token()?, reqwest::Client::new());

            let figis = if figis.is_empty() { None } else { Some(figis) };
            application::download_history(figis, archives, storage).await?;
        }
    }

    Ok(())
}

fn invest_token() -> anyhow::Result<SecretString> {
    let token =
        env::var(INVEST_TOKEN_ENV_VAR).with_context(|| format!("read {INVEST_TOKEN_ENV_VAR}"))?;
    Ok(token.into())
}
