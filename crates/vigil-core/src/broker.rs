// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker topology and connection helpers.
//!
//! One direct exchange, a durable request queue and a durable result queue,
//! each bound under a fixed routing key. Declarations are idempotent and
//! repeated on every connect, since a broker restart invalidates earlier
//! declarations.

use std::time::Duration;

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::warn;

use crate::error::{Error, Result};

/// Deadline for one broker connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum connect attempts before surfacing the error.
pub const CONNECT_ATTEMPTS: u32 = 5;

/// Backoff before the second connect attempt.
pub const CONNECT_BACKOFF_START: Duration = Duration::from_millis(200);

/// Backoff increase per further attempt.
pub const CONNECT_BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Backoff ceiling.
pub const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Exchange and queue names shared by publisher and consumer.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Direct exchange all check traffic flows through.
    pub exchange: String,
    /// Durable queue carrying dispatch envelopes to workers.
    pub request_queue: String,
    /// Durable queue carrying result envelopes back.
    pub result_queue: String,
    /// Routing key for dispatches.
    pub request_key: String,
    /// Routing key for results.
    pub result_key: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: "vigil.checks".to_string(),
            request_queue: "vigil.checks.requests".to_string(),
            result_queue: "vigil.checks.results".to_string(),
            request_key: "checks.run".to_string(),
            result_key: "checks.result".to_string(),
        }
    }
}

/// Open a broker connection, bounded by [`CONNECT_TIMEOUT`].
pub async fn connect(amqp_url: &str) -> Result<Connection> {
    let attempt = Connection::connect(amqp_url, ConnectionProperties::default());
    match tokio::time::timeout(CONNECT_TIMEOUT, attempt).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::BrokerConnectTimeout),
    }
}

/// Open a broker connection with bounded backoff.
///
/// Delays grow from [`CONNECT_BACKOFF_START`] by [`CONNECT_BACKOFF_STEP`]
/// per attempt, capped at [`CONNECT_BACKOFF_CAP`]; after
/// [`CONNECT_ATTEMPTS`] failures the last error propagates.
pub async fn connect_with_retry(amqp_url: &str) -> Result<Connection> {
    let mut delay = CONNECT_BACKOFF_START;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match connect(amqp_url).await {
            Ok(connection) => return Ok(connection),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(attempt, error = %e, "Broker connect failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay + CONNECT_BACKOFF_STEP).min(CONNECT_BACKOFF_CAP);
            }
            Err(e) => return Err(e),
        }
    }
    // 1..=CONNECT_ATTEMPTS with CONNECT_ATTEMPTS >= 1 always returns above
    Err(Error::BrokerConnectTimeout)
}

async fn declare_exchange(channel: &Channel, topology: &Topology) -> Result<()> {
    channel
        .exchange_declare(
            &topology.exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

async fn declare_queue(channel: &Channel, topology: &Topology, queue: &str, key: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            queue,
            &topology.exchange,
            key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

/// Declare the exchange plus the request queue and binding.
pub async fn declare_request_path(channel: &Channel, topology: &Topology) -> Result<()> {
    declare_exchange(channel, topology).await?;
    declare_queue(channel, topology, &topology.request_queue, &topology.request_key).await
}

/// Declare the exchange plus the result queue and binding.
pub async fn declare_result_path(channel: &Channel, topology: &Topology) -> Result<()> {
    declare_exchange(channel, topology).await?;
    declare_queue(channel, topology, &topology.result_queue, &topology.result_key).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topology_names() {
        let topology = Topology::default();
        assert_eq!(topology.exchange, "vigil.checks");
        assert_eq!(topology.request_queue, "vigil.checks.requests");
        assert_eq!(topology.result_queue, "vigil.checks.results");
        assert_ne!(topology.request_key, topology.result_key);
    }

    #[test]
    fn test_backoff_schedule_is_bounded() {
        let mut delay = CONNECT_BACKOFF_START;
        let mut total = Duration::ZERO;
        for _ in 1..CONNECT_ATTEMPTS {
            total += delay;
            delay = (delay + CONNECT_BACKOFF_STEP).min(CONNECT_BACKOFF_CAP);
        }
        assert_eq!(delay, CONNECT_BACKOFF_CAP);
        // Worst case waits stay well under the drain timeout
        assert!(total < Duration::from_secs(10));
    }
}
