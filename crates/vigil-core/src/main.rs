// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vigil Core - Monitoring Pipeline Server
//!
//! A long-running process responsible for:
//! - Dispatching due checks to the request queue once per minute
//! - Consuming worker results from the result queue
//! - Recording run history and advancing incident lifecycles

use std::sync::Arc;
use tracing::{info, warn};

use vigil_core::broker::Topology;
use vigil_core::cache::RedisDedupCache;
use vigil_core::config::Config;
use vigil_core::consumer::{ConsumerConfig, ResultConsumer};
use vigil_core::processor::ResultProcessor;
use vigil_core::publisher::Publisher;
use vigil_core::scheduler::TickWorker;
use vigil_core::store::{PostgresStore, postgres};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        prefetch = config.prefetch,
        scheduler_enabled = config.scheduler_enabled,
        "Starting Vigil Core"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    postgres::ensure_schema(&pool).await?;

    info!("Database schema verified");

    // Dedup cache (reconnects on its own)
    let cache = Arc::new(RedisDedupCache::connect(&config.redis_url).await?);
    info!("Connected to dedup cache");

    let store = Arc::new(PostgresStore::new(pool));
    let topology = Topology::default();
    let processor = Arc::new(ResultProcessor::new(store.clone(), cache));

    // Result consumer
    let mut consumer_config = ConsumerConfig::new(config.amqp_url.clone());
    consumer_config.prefetch = config.prefetch;
    let consumer = ResultConsumer::new(consumer_config, topology.clone(), processor);
    let consumer_shutdown = consumer.shutdown_handle();
    let consumer_handle = tokio::spawn(consumer.run());

    // Minute tick worker
    let mut tick_shutdown = None;
    let mut tick_handle = None;
    if config.scheduler_enabled {
        let publisher = Arc::new(Publisher::new(config.amqp_url.clone(), topology));
        let worker = TickWorker::new(store, publisher);
        tick_shutdown = Some(worker.shutdown_handle());
        tick_handle = Some(tokio::spawn(worker.run()));
    }

    info!("Vigil Core ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    consumer_shutdown.notify_one();
    if let Some(shutdown) = tick_shutdown {
        shutdown.notify_one();
    }
    consumer_handle.await?;
    if let Some(handle) = tick_handle {
        handle.await?;
    }

    info!("Vigil Core shut down");

    Ok(())
}
