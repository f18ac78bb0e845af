// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence layer for projects, checks, runs, and incidents.
//!
//! The pipeline reads project/check configuration and writes run history
//! and incident lifecycle records. All writes for one result message happen
//! in a single transaction behind [`Store::record_run`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::RunStatus;
use crate::error::Result;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Tenant boundary owning checks and incidents.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRecord {
    /// Project id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// IANA timezone name; the scheduler default applies when absent.
    pub timezone: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Logical deletion marker; deleted projects are skipped everywhere.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A configured probe definition. Read-only to this pipeline.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckRecord {
    /// Check id.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Display name, used in incident titles.
    pub name: String,
    /// Probe kind executed by workers.
    #[sqlx(rename = "type")]
    pub check_type: String,
    /// Opaque probe parameters, merged with overrides at dispatch time.
    pub config: Value,
    /// Cron expression evaluated in the project timezone.
    pub schedule: String,
    /// Disabled checks are never dispatched.
    pub is_enabled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// One persisted check execution outcome.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckRunRecord {
    /// Run id.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Check this run belongs to.
    pub check_id: Uuid,
    /// Outcome status (pass/warn/fail/error).
    pub status: String,
    /// Derived start time (`finished_at` minus latency).
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
    /// Probe latency in milliseconds, when reported.
    pub latency_ms: Option<i64>,
    /// HTTP status, when the probe is HTTP-shaped.
    pub http_status_code: Option<i32>,
    /// Raw result payload as received.
    pub result: Value,
    /// Worker error text, truncated on storage.
    pub error_message: String,
    /// Incident this run opened, if it opened one.
    pub opened_incident_id: Option<Uuid>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle record for one failure streak on a (project, check) pair.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IncidentRecord {
    /// Incident id.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Failing check.
    pub check_id: Uuid,
    /// Human-readable title.
    pub title: String,
    /// How the incident came to exist.
    pub description: String,
    /// `open` or `resolved`.
    pub state: String,
    /// Failure streak length while open.
    pub consecutive_failures: i32,
    /// First failure in the streak.
    pub first_seen_at: DateTime<Utc>,
    /// Most recent status that touched the incident.
    pub last_seen_at: DateTime<Utc>,
    /// Resolution time, once resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Fields for a run about to be persisted.
#[derive(Debug, Clone)]
pub struct NewCheckRun {
    /// Validated outcome status.
    pub status: RunStatus,
    /// Derived start time.
    pub started_at: DateTime<Utc>,
    /// Completion time (already defaulted when absent on the wire).
    pub finished_at: DateTime<Utc>,
    /// Non-negative latency, when reported.
    pub latency_ms: Option<i64>,
    /// Tolerantly-extracted HTTP status.
    pub http_status_code: Option<i32>,
    /// Raw result payload.
    pub result: Value,
    /// Error text, already truncated.
    pub error_message: String,
}

/// Incident side-effect applied while recording a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentOutcome {
    /// A new incident was opened by this run.
    Opened(Uuid),
    /// The open incident's failure streak was extended.
    Extended {
        /// Incident id.
        id: Uuid,
        /// Streak length after the increment.
        consecutive_failures: i32,
    },
    /// The open incident was resolved by this run.
    Resolved(Uuid),
    /// No incident mutation (warn, or pass with nothing open).
    Unchanged,
}

/// What `record_run` did: the run row plus the incident side-effect.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Id of the inserted run.
    pub run_id: Uuid,
    /// Incident transition applied in the same transaction.
    pub incident: IncidentOutcome,
}

/// Storage operations the pipeline needs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a project by id. Deleted projects are reported as absent.
    async fn get_project(&self, id: Uuid) -> Result<Option<ProjectRecord>>;

    /// Fetch a check by id, scoped to its owning project.
    async fn get_check(&self, project_id: Uuid, check_id: Uuid) -> Result<Option<CheckRecord>>;

    /// All enabled checks with their (non-deleted) owning projects.
    async fn list_enabled_checks(&self) -> Result<Vec<(CheckRecord, ProjectRecord)>>;

    /// Persist a run and apply its incident transition in one transaction.
    async fn record_run(&self, check: &CheckRecord, run: NewCheckRun) -> Result<RunReport>;

    /// Fetch a run by id.
    async fn get_run(&self, id: Uuid) -> Result<Option<CheckRunRecord>>;

    /// The pair's open incident, if one exists.
    async fn open_incident(&self, project_id: Uuid, check_id: Uuid)
    -> Result<Option<IncidentRecord>>;

    /// All incidents for a pair, oldest first.
    async fn list_incidents(
        &self,
        project_id: Uuid,
        check_id: Uuid,
    ) -> Result<Vec<IncidentRecord>>;
}
