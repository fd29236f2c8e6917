// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use clap::Parser;
use metrics_generator::config::{Config, LogLevel};
use metrics_generator::generator::Generator;
use metrics_generator::logger;
use metrics_generator::ring::kv::InMemoryStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Derives service-graph and span metrics from trace spans and pushes them
/// to a remote-write endpoint.
#[derive(Debug, Parser)]
#[command(name = "metrics-generator", version)]
struct Args {
    /// YAML configuration file. `GENERATOR_*` environment variables take
    /// precedence over it.
    #[arg(long = "config.file", value_name = "PATH")]
    config_file: Option<PathBuf>,

    /// Overrides `log_level` from the configuration.
    #[arg(long = "log.level", value_name = "LEVEL")]
    log_level: Option<LogLevel>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config_file.as_deref())
        .context("could not load generator configuration")?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(config.log_level.env_filter())
                .context("could not parse log level in configuration")?,
        )
        .event_format(logger::Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    debug!("Logging subsystem enabled");

    // Single-node membership; every instance in the ring shares this store.
    let store = Arc::new(InMemoryStore::new());
    let generator =
        Arc::new(Generator::new(config, store).context("could not create generator")?);
    generator
        .start()
        .await
        .context("could not start generator")?;

    let cancel = CancellationToken::new();
    let reporter = tokio::spawn(report_stats(Arc::clone(&generator), cancel.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }

    cancel.cancel();
    if let Err(e) = reporter.await {
        error!("Stats reporter failed: {e}");
    }
    generator
        .shutdown()
        .await
        .context("generator did not shut down cleanly")?;
    info!("Generator stopped");
    Ok(())
}

async fn report_stats(generator: Arc<Generator>, cancel: CancellationToken) {
    let mut ticker = interval(STATS_REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = generator.stats();
                info!(
                    "Instance {} ({}): {} tenants, {} spans received, {} not owned, {} rejected, {} batches sent, {} dropped, {} failed",
                    stats.instance_id,
                    stats.state,
                    stats.registry.active_tenants,
                    stats.spans_received,
                    stats.spans_not_owned,
                    stats.spans_rejected,
                    stats.exporter.batches_sent,
                    stats.exporter.batches_dropped,
                    stats.exporter.batches_failed + stats.exporter.batches_rejected,
                );
            }
        }
    }
}
