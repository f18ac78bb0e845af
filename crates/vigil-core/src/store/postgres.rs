// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store.
//!
//! Plain queries with explicit binds; the one-open-incident invariant is
//! additionally enforced by a partial unique index in the schema, so a
//! racing writer fails its transaction instead of opening a second
//! incident.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::incident::{self, Transition};

use super::{
    CheckRecord, CheckRunRecord, IncidentOutcome, IncidentRecord, NewCheckRun, ProjectRecord,
    RunReport, Store,
};

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new Postgres-backed store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Apply the pipeline schema idempotently.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(include_str!("../../migrations/schema.sql"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Get a non-deleted project by ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<ProjectRecord>> {
    let record = sqlx::query_as::<_, ProjectRecord>(
        r#"
        SELECT id, name, timezone, created_at, deleted_at
        FROM projects
        WHERE id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Get a check by ID, scoped to its owning project.
pub async fn get_check(
    pool: &PgPool,
    project_id: Uuid,
    check_id: Uuid,
) -> Result<Option<CheckRecord>> {
    let record = sqlx::query_as::<_, CheckRecord>(
        r#"
        SELECT id, project_id, name, type, config, schedule, is_enabled, created_at
        FROM checks
        WHERE id = $1 AND project_id = $2
        "#,
    )
    .bind(check_id)
    .bind(project_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Flattened row for the enabled-checks scheduler scan.
#[derive(sqlx::FromRow)]
struct EnabledCheckRow {
    id: Uuid,
    project_id: Uuid,
    name: String,
    #[sqlx(rename = "type")]
    check_type: String,
    config: Value,
    schedule: String,
    is_enabled: bool,
    created_at: DateTime<Utc>,
    p_name: String,
    p_timezone: Option<String>,
    p_created_at: DateTime<Utc>,
    p_deleted_at: Option<DateTime<Utc>>,
}

/// All enabled checks joined with their non-deleted owning projects.
pub async fn list_enabled_checks(pool: &PgPool) -> Result<Vec<(CheckRecord, ProjectRecord)>> {
    let rows = sqlx::query_as::<_, EnabledCheckRow>(
        r#"
        SELECT c.id, c.project_id, c.name, c.type, c.config, c.schedule,
               c.is_enabled, c.created_at,
               p.name AS p_name, p.timezone AS p_timezone,
               p.created_at AS p_created_at, p.deleted_at AS p_deleted_at
        FROM checks c
        JOIN projects p ON p.id = c.project_id
        WHERE c.is_enabled AND p.deleted_at IS NULL
        ORDER BY c.created_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let project = ProjectRecord {
                id: row.project_id,
                name: row.p_name,
                timezone: row.p_timezone,
                created_at: row.p_created_at,
                deleted_at: row.p_deleted_at,
            };
            let check = CheckRecord {
                id: row.id,
                project_id: row.project_id,
                name: row.name,
                check_type: row.check_type,
                config: row.config,
                schedule: row.schedule,
                is_enabled: row.is_enabled,
                created_at: row.created_at,
            };
            (check, project)
        })
        .collect())
}

/// Persist a run and apply its incident transition in one transaction.
pub async fn record_run(
    pool: &PgPool,
    check: &CheckRecord,
    run: NewCheckRun,
) -> Result<RunReport> {
    let mut tx = pool.begin().await?;

    let run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO check_runs
            (id, project_id, check_id, status, started_at, finished_at,
             latency_ms, http_status_code, result, error_message)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(run_id)
    .bind(check.project_id)
    .bind(check.id)
    .bind(run.status.as_str())
    .bind(run.started_at)
    .bind(run.finished_at)
    .bind(run.latency_ms)
    .bind(run.http_status_code)
    .bind(&run.result)
    .bind(&run.error_message)
    .execute(&mut *tx)
    .await?;

    // Lock the pair's open incident for the rest of the transaction
    let open = sqlx::query_as::<_, IncidentRecord>(
        r#"
        SELECT id, project_id, check_id, title, description, state,
               consecutive_failures, first_seen_at, last_seen_at,
               resolved_at, created_at
        FROM incidents
        WHERE project_id = $1 AND check_id = $2 AND state = 'open'
        FOR UPDATE
        "#,
    )
    .bind(check.project_id)
    .bind(check.id)
    .fetch_optional(&mut *tx)
    .await?;

    let transition = incident::plan_transition(open.as_ref(), run.status);
    let outcome = match (transition, open) {
        (Transition::Open, _) => {
            let incident_id = Uuid::new_v4();
            sqlx::query(
                r#"
                INSERT INTO incidents
                    (id, project_id, check_id, title, description, state,
                     consecutive_failures, first_seen_at, last_seen_at)
                VALUES ($1, $2, $3, $4, $5, 'open', 1, $6, $6)
                "#,
            )
            .bind(incident_id)
            .bind(check.project_id)
            .bind(check.id)
            .bind(incident::title_for(&check.name))
            .bind(incident::description_for(run_id))
            .bind(run.finished_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE check_runs SET opened_incident_id = $1 WHERE id = $2")
                .bind(incident_id)
                .bind(run_id)
                .execute(&mut *tx)
                .await?;

            IncidentOutcome::Opened(incident_id)
        }
        (Transition::Extend, Some(existing)) => {
            let (consecutive_failures,): (i32,) = sqlx::query_as(
                r#"
                UPDATE incidents
                SET consecutive_failures = consecutive_failures + 1,
                    last_seen_at = $1
                WHERE id = $2
                RETURNING consecutive_failures
                "#,
            )
            .bind(run.finished_at)
            .bind(existing.id)
            .fetch_one(&mut *tx)
            .await?;

            IncidentOutcome::Extended {
                id: existing.id,
                consecutive_failures,
            }
        }
        (Transition::Resolve, Some(existing)) => {
            sqlx::query(
                r#"
                UPDATE incidents
                SET state = 'resolved', last_seen_at = $1, resolved_at = $1
                WHERE id = $2
                "#,
            )
            .bind(run.finished_at)
            .bind(existing.id)
            .execute(&mut *tx)
            .await?;

            IncidentOutcome::Resolved(existing.id)
        }
        _ => IncidentOutcome::Unchanged,
    };

    tx.commit().await?;

    Ok(RunReport {
        run_id,
        incident: outcome,
    })
}

/// Get a run by ID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<CheckRunRecord>> {
    let record = sqlx::query_as::<_, CheckRunRecord>(
        r#"
        SELECT id, project_id, check_id, status, started_at, finished_at,
               latency_ms, http_status_code, result, error_message,
               opened_incident_id, created_at
        FROM check_runs
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// The pair's open incident, if one exists.
pub async fn open_incident(
    pool: &PgPool,
    project_id: Uuid,
    check_id: Uuid,
) -> Result<Option<IncidentRecord>> {
    let record = sqlx::query_as::<_, IncidentRecord>(
        r#"
        SELECT id, project_id, check_id, title, description, state,
               consecutive_failures, first_seen_at, last_seen_at,
               resolved_at, created_at
        FROM incidents
        WHERE project_id = $1 AND check_id = $2 AND state = 'open'
        "#,
    )
    .bind(project_id)
    .bind(check_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// All incidents for a pair, oldest first.
pub async fn list_incidents(
    pool: &PgPool,
    project_id: Uuid,
    check_id: Uuid,
) -> Result<Vec<IncidentRecord>> {
    let records = sqlx::query_as::<_, IncidentRecord>(
        r#"
        SELECT id, project_id, check_id, title, description, state,
               consecutive_failures, first_seen_at, last_seen_at,
               resolved_at, created_at
        FROM incidents
        WHERE project_id = $1 AND check_id = $2
        ORDER BY created_at
        "#,
    )
    .bind(project_id)
    .bind(check_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_project(&self, id: Uuid) -> Result<Option<ProjectRecord>> {
        get_project(&self.pool, id).await
    }

    async fn get_check(&self, project_id: Uuid, check_id: Uuid) -> Result<Option<CheckRecord>> {
        get_check(&self.pool, project_id, check_id).await
    }

    async fn list_enabled_checks(&self) -> Result<Vec<(CheckRecord, ProjectRecord)>> {
        list_enabled_checks(&self.pool).await
    }

    async fn record_run(&self, check: &CheckRecord, run: NewCheckRun) -> Result<RunReport> {
        record_run(&self.pool, check, run).await
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<CheckRunRecord>> {
        get_run(&self.pool, id).await
    }

    async fn open_incident(
        &self,
        project_id: Uuid,
        check_id: Uuid,
    ) -> Result<Option<IncidentRecord>> {
        open_incident(&self.pool, project_id, check_id).await
    }

    async fn list_incidents(
        &self,
        project_id: Uuid,
        check_id: Uuid,
    ) -> Result<Vec<IncidentRecord>> {
        list_incidents(&self.pool, project_id, check_id).await
    }
}
