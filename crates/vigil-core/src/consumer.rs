// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Long-running result consumer.
//!
//! Owns the broker connection lifecycle: connect, declare, consume, and on
//! any connection-level error tear down and reconnect after a short delay.
//! Messages are handled one at a time; every per-message failure is
//! converted to a reject-without-requeue at this boundary so a poison
//! message can never crash the process or loop forever.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions};
use lapin::types::FieldTable;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::broker::{self, Topology};
use crate::envelope::{self, ResultEnvelope};
use crate::error::{Error, Result};
use crate::processor::{Outcome, ResultProcessor};

/// Result consumer tuning knobs.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// AMQP broker URL.
    pub amqp_url: String,
    /// In-flight unacknowledged message window.
    pub prefetch: u16,
    /// How long one drain wait may block before the connection is probed.
    pub drain_timeout: Duration,
    /// Pause between teardown and the next connect attempt.
    pub reconnect_delay: Duration,
}

impl ConsumerConfig {
    /// Config with default tuning for the given broker URL.
    pub fn new(amqp_url: impl Into<String>) -> Self {
        Self {
            amqp_url: amqp_url.into(),
            prefetch: 50,
            drain_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

/// Long-lived consumer feeding the result processor.
pub struct ResultConsumer {
    config: ConsumerConfig,
    topology: Topology,
    processor: Arc<ResultProcessor>,
    shutdown: Arc<Notify>,
}

impl ResultConsumer {
    /// Create a new result consumer.
    pub fn new(config: ConsumerConfig, topology: Topology, processor: Arc<ResultProcessor>) -> Self {
        Self {
            config,
            topology,
            processor,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconnect supervision loop until shutdown.
    pub async fn run(self) {
        info!(
            queue = %self.topology.result_queue,
            prefetch = self.config.prefetch,
            "Result consumer started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Result consumer shutting down");
                    break;
                }
                session = self.run_session() => {
                    match session {
                        Ok(()) => debug!("Consumer session ended"),
                        Err(e) => warn!(error = %e, "Consumer session failed"),
                    }
                }
            }

            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Result consumer shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// One connection's worth of consuming.
    ///
    /// Returns Ok when the broker cancels the consumer stream cleanly; any
    /// error means the connection is gone and the caller should reconnect.
    async fn run_session(&self) -> Result<()> {
        let connection = broker::connect(&self.config.amqp_url).await?;
        let channel = connection.create_channel().await?;
        broker::declare_result_path(&channel, &self.topology).await?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;

        let mut consumer = channel
            .basic_consume(
                &self.topology.result_queue,
                "vigil-result-consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %self.topology.result_queue, "Consuming check results");

        loop {
            match tokio::time::timeout(self.config.drain_timeout, consumer.next()).await {
                // Nothing arrived; probe the connection before waiting again
                Err(_) => {
                    if !connection.status().connected() {
                        return Err(Error::BrokerConnectionLost);
                    }
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(delivery))) => self.handle_delivery(delivery).await?,
            }
        }
    }

    /// Handle one delivery; only broker I/O errors propagate.
    async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        let property_correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string());

        let decoded = envelope::parse_result_body(&delivery.data).and_then(|map| {
            ResultEnvelope::from_object(map, property_correlation_id.as_deref())
        });

        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Rejecting undecodable result message");
                delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await?;
                return Ok(());
            }
        };

        let correlation_id = envelope.correlation_id.clone();
        match self.processor.process(envelope).await {
            Ok(Outcome::Recorded(_)) => {
                delivery.ack(BasicAckOptions::default()).await?;
            }
            Ok(Outcome::Duplicate) => {
                debug!(correlation_id = %correlation_id, "Acknowledging duplicate delivery");
                delivery.ack(BasicAckOptions::default()).await?;
            }
            Err(e) if e.is_terminal() => {
                warn!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Rejecting unprocessable result"
                );
                delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await?;
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }
}
