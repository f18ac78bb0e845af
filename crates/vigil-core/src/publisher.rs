// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Check dispatch publisher.
//!
//! Dispatch is fire-and-forget: the caller gets a correlation id back, and
//! the absence of a later result is the only failure signal. Each dispatch
//! opens its own connection, so parallel callers share no broker state.

use async_trait::async_trait;
use chrono::Utc;
use lapin::BasicProperties;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{self, Topology};
use crate::envelope::{DispatchEnvelope, PROTOCOL_VERSION, deep_merge, mask_secrets};
use crate::error::Result;
use crate::store::{CheckRecord, ProjectRecord};

/// Dispatches check-run requests. The seam the scheduler tests against.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Publish one check-run request; returns the fresh correlation id.
    async fn dispatch(
        &self,
        project: &ProjectRecord,
        check: &CheckRecord,
        timeout_sec: u64,
        overrides: Option<&Value>,
        type_override: Option<&str>,
    ) -> Result<Uuid>;
}

/// AMQP-backed publisher.
pub struct Publisher {
    amqp_url: String,
    topology: Topology,
}

impl Publisher {
    /// Create a publisher for the given broker URL and topology.
    pub fn new(amqp_url: impl Into<String>, topology: Topology) -> Self {
        Self {
            amqp_url: amqp_url.into(),
            topology,
        }
    }

    /// Build the dispatch envelope for a check.
    ///
    /// Pure: merges overrides into the stored config and stamps the
    /// correlation id, protocol version, and reply queue.
    pub fn build_envelope(
        &self,
        check: &CheckRecord,
        timeout_sec: u64,
        overrides: Option<&Value>,
        type_override: Option<&str>,
    ) -> DispatchEnvelope {
        let config = match overrides {
            Some(overrides) => deep_merge(&check.config, overrides),
            None => check.config.clone(),
        };
        DispatchEnvelope {
            version: PROTOCOL_VERSION,
            correlation_id: Uuid::new_v4(),
            project_id: check.project_id,
            check_id: check.id,
            check_type: type_override.unwrap_or(&check.check_type).to_string(),
            config,
            timeout_sec,
            reply_to: self.topology.result_queue.clone(),
            sent_at: Utc::now(),
        }
    }
}

#[async_trait]
impl Dispatcher for Publisher {
    async fn dispatch(
        &self,
        project: &ProjectRecord,
        check: &CheckRecord,
        timeout_sec: u64,
        overrides: Option<&Value>,
        type_override: Option<&str>,
    ) -> Result<Uuid> {
        let envelope = self.build_envelope(check, timeout_sec, overrides, type_override);
        let payload = serde_json::to_vec(&envelope)?;

        let connection = broker::connect_with_retry(&self.amqp_url).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        broker::declare_request_path(&channel, &self.topology).await?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_correlation_id(envelope.correlation_id.to_string().into())
            .with_reply_to(self.topology.result_queue.clone().into());

        let mut confirmation = channel
            .basic_publish(
                &self.topology.exchange,
                &self.topology.request_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &payload,
                properties,
            )
            .await?
            .await?;

        if confirmation.take_message().is_some() {
            // No queue matched the routing key; the caller still succeeds
            warn!(
                correlation_id = %envelope.correlation_id,
                check_id = %check.id,
                "Dispatch message unroutable, no queue bound"
            );
        }

        if let Err(e) = connection.close(200, "dispatch complete").await {
            debug!(error = %e, "Broker connection close failed after dispatch");
        }

        info!(
            correlation_id = %envelope.correlation_id,
            project = %project.name,
            check = %check.name,
            check_type = %envelope.check_type,
            timeout_sec,
            overrides = %overrides.map(|o| mask_secrets(o).to_string()).unwrap_or_default(),
            "Dispatched check run"
        );

        Ok(envelope.correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn check_with_config(config: Value) -> CheckRecord {
        CheckRecord {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "api".to_string(),
            check_type: "http".to_string(),
            config,
            schedule: "* * * * *".to_string(),
            is_enabled: true,
            created_at: Utc::now(),
        }
    }

    fn publisher() -> Publisher {
        Publisher::new("amqp://localhost", Topology::default())
    }

    #[test]
    fn test_envelope_merges_overrides() {
        let check = check_with_config(json!({"url": "https://example.com", "expect": {"status": 200}}));
        let envelope = publisher().build_envelope(
            &check,
            10,
            Some(&json!({"expect": {"status": 204}})),
            None,
        );
        assert_eq!(
            envelope.config,
            json!({"url": "https://example.com", "expect": {"status": 204}})
        );
        assert_eq!(envelope.version, PROTOCOL_VERSION);
        assert_eq!(envelope.reply_to, "vigil.checks.results");
    }

    #[test]
    fn test_envelope_type_override() {
        let check = check_with_config(json!({}));
        let envelope = publisher().build_envelope(&check, 10, None, Some("tcp"));
        assert_eq!(envelope.check_type, "tcp");

        let envelope = publisher().build_envelope(&check, 10, None, None);
        assert_eq!(envelope.check_type, "http");
    }

    #[test]
    fn test_correlation_ids_are_fresh() {
        let check = check_with_config(json!({}));
        let p = publisher();
        let a = p.build_envelope(&check, 10, None, None);
        let b = p.build_envelope(&check, 10, None, None);
        assert_ne!(a.correlation_id, b.correlation_id);
    }
}
