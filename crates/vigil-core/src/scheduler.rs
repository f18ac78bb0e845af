// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron scheduling: deciding which checks are due each minute.
//!
//! Cron expressions are evaluated at minute granularity in the owning
//! project's timezone. The dueness test and timezone fallback are pure;
//! [`TickWorker`] drives them once per minute as a background task, but
//! `evaluate_due` can equally be called by an external trigger.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use croner::Cron;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::publisher::Dispatcher;
use crate::store::Store;

/// Timezone used when a project has none configured.
pub const DEFAULT_TIMEZONE: &str = "Europe/Amsterdam";

/// Worker-side timeout when a check config carries none.
pub const DEFAULT_TIMEOUT_SEC: u64 = 10;

/// Floor a timestamp to its minute.
fn minute_floor<Z: TimeZone>(t: DateTime<Z>) -> DateTime<Z> {
    t.clone()
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Whether `cron` fires at the minute containing `now_local`.
///
/// The expression's next occurrence strictly after the previous minute must
/// land exactly on the current minute floor. Any parse or evaluation error
/// means "not due"; a malformed schedule on one check never affects others.
pub fn is_due_this_minute(cron: &str, now_local: DateTime<Tz>) -> bool {
    let floor = minute_floor(now_local);
    let base = floor - chrono::Duration::minutes(1);
    let parsed = match Cron::new(cron).parse() {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(cron, error = %e, "Unparseable cron expression");
            return false;
        }
    };
    match parsed.find_next_occurrence(&base, false) {
        Ok(next) => next == floor,
        Err(e) => {
            debug!(cron, error = %e, "Cron evaluation failed");
            false
        }
    }
}

/// Resolve a project's timezone name.
///
/// Falls back to [`DEFAULT_TIMEZONE`] when unset; an invalid name falls all
/// the way back to UTC, i.e. the instant is used unmodified.
pub fn resolve_timezone(timezone: Option<&str>) -> Tz {
    let name = timezone.filter(|n| !n.is_empty()).unwrap_or(DEFAULT_TIMEZONE);
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = name, "Unknown timezone, using UTC");
            Tz::UTC
        }
    }
}

/// Worker timeout for a check, from its config.
pub fn timeout_from_config(config: &Value) -> u64 {
    config
        .get("timeout")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_TIMEOUT_SEC)
}

/// Dispatch every enabled check that is due in the minute containing
/// `now_utc`. Returns how many checks were dispatched. Per-check dispatch
/// errors are logged and skipped.
pub async fn evaluate_due(
    store: &dyn Store,
    dispatcher: &dyn Dispatcher,
    now_utc: DateTime<Utc>,
) -> Result<u32> {
    let mut dispatched = 0;
    for (check, project) in store.list_enabled_checks().await? {
        let tz = resolve_timezone(project.timezone.as_deref());
        let now_local = now_utc.with_timezone(&tz);
        if !is_due_this_minute(&check.schedule, now_local) {
            continue;
        }

        let timeout_sec = timeout_from_config(&check.config);
        match dispatcher
            .dispatch(&project, &check, timeout_sec, None, None)
            .await
        {
            Ok(correlation_id) => {
                dispatched += 1;
                debug!(
                    correlation_id = %correlation_id,
                    check = %check.name,
                    "Due check dispatched"
                );
            }
            Err(e) => {
                warn!(check = %check.name, error = %e, "Failed to dispatch due check");
            }
        }
    }
    Ok(dispatched)
}

/// Background task that evaluates due checks once per minute.
pub struct TickWorker {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn Dispatcher>,
    shutdown: Arc<Notify>,
}

impl TickWorker {
    /// Create a new tick worker.
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the tick loop, aligned to minute boundaries.
    pub async fn run(self) {
        info!("Tick worker started");

        loop {
            let now = Utc::now();
            let next_minute = minute_floor(now) + chrono::Duration::minutes(1);
            let wait = (next_minute - now)
                .to_std()
                .unwrap_or(Duration::from_secs(60));

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Tick worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    match evaluate_due(self.store.as_ref(), self.dispatcher.as_ref(), Utc::now()).await {
                        Ok(dispatched) if dispatched > 0 => {
                            info!(dispatched, "Tick dispatched due checks");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Tick evaluation failed");
                        }
                    }
                }
            }
        }
    }
}
