// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result processor: one idempotent, transactional unit of work per message.
//!
//! The dedup claim happens before any database work so a redelivered
//! message becomes a silent no-op. Everything after the claim runs in one
//! store transaction; a crash mid-processing never leaves a run without its
//! incident side-effect.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::cache::DedupCache;
use crate::envelope::{ResultEnvelope, derive_started_at};
use crate::error::{Error, Result};
use crate::store::{NewCheckRun, RunReport, Store};

/// How long a processed correlation id stays claimed.
pub const DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Storage cap for worker-reported error text.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 2000;

/// Dedup cache key for a correlation id.
pub fn dedup_key(correlation_id: &str) -> String {
    format!("vigil:processed:{correlation_id}")
}

/// What processing one result message did.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The run was persisted, with its incident side-effect.
    Recorded(RunReport),
    /// The correlation id was already claimed; nothing was done.
    Duplicate,
}

/// Turns validated result envelopes into stored run history.
pub struct ResultProcessor {
    store: Arc<dyn Store>,
    cache: Arc<dyn DedupCache>,
}

impl ResultProcessor {
    /// Create a processor over the given store and dedup cache.
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn DedupCache>) -> Self {
        Self { store, cache }
    }

    /// Process one result envelope.
    ///
    /// Idempotent per correlation id: at-least-once delivery upstream
    /// yields exactly one stored run.
    pub async fn process(&self, envelope: ResultEnvelope) -> Result<Outcome> {
        let key = dedup_key(&envelope.correlation_id);
        if !self.cache.claim(&key, DEDUP_TTL).await? {
            debug!(
                correlation_id = %envelope.correlation_id,
                "Result already processed, skipping"
            );
            return Ok(Outcome::Duplicate);
        }

        let project = self
            .store
            .get_project(envelope.project_id)
            .await?
            .ok_or(Error::ProjectNotFound(envelope.project_id))?;
        let check = self
            .store
            .get_check(project.id, envelope.check_id)
            .await?
            .ok_or(Error::CheckNotFound {
                project_id: project.id,
                check_id: envelope.check_id,
            })?;

        let finished_at = envelope.finished_at.unwrap_or_else(Utc::now);
        let started_at = derive_started_at(finished_at, envelope.latency_ms);
        let error_message = envelope
            .error_message
            .as_deref()
            .map(truncate_error_message)
            .unwrap_or_default();

        let report = self
            .store
            .record_run(
                &check,
                NewCheckRun {
                    status: envelope.status,
                    started_at,
                    finished_at,
                    latency_ms: envelope.latency_ms,
                    http_status_code: envelope.http_status_code,
                    result: envelope.payload,
                    error_message,
                },
            )
            .await?;

        info!(
            correlation_id = %envelope.correlation_id,
            run_id = %report.run_id,
            check = %check.name,
            status = %envelope.status,
            incident = ?report.incident,
            "Recorded check run"
        );

        Ok(Outcome::Recorded(report))
    }
}

/// Truncate worker error text to its storage cap, on a char boundary.
pub fn truncate_error_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_key_format() {
        assert_eq!(dedup_key("abc-123"), "vigil:processed:abc-123");
    }

    #[test]
    fn test_truncation_is_char_safe() {
        let message = "é".repeat(MAX_ERROR_MESSAGE_CHARS + 100);
        let truncated = truncate_error_message(&message);
        assert_eq!(truncated.chars().count(), MAX_ERROR_MESSAGE_CHARS);

        assert_eq!(truncate_error_message("short"), "short");
    }
}
