// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store for testing.
//!
//! A simple store implementation backed by maps behind one async mutex,
//! so each `record_run` is atomic the same way the Postgres transaction is.
//! Shares the incident transition logic with the real store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::incident::{self, STATE_OPEN, STATE_RESOLVED, Transition};

use super::{
    CheckRecord, CheckRunRecord, IncidentOutcome, IncidentRecord, NewCheckRun, ProjectRecord,
    RunReport, Store,
};

#[derive(Default)]
struct Inner {
    projects: HashMap<Uuid, ProjectRecord>,
    checks: HashMap<Uuid, CheckRecord>,
    runs: HashMap<Uuid, CheckRunRecord>,
    incidents: Vec<IncidentRecord>,
}

/// In-memory store for testing.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a project and return its record.
    pub async fn add_project(&self, name: &str, timezone: Option<&str>) -> ProjectRecord {
        let record = ProjectRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            timezone: timezone.map(str::to_string),
            created_at: Utc::now(),
            deleted_at: None,
        };
        let mut inner = self.inner.lock().await;
        inner.projects.insert(record.id, record.clone());
        record
    }

    /// Insert a check and return its record.
    pub async fn add_check(
        &self,
        project_id: Uuid,
        name: &str,
        check_type: &str,
        config: Value,
        schedule: &str,
        is_enabled: bool,
    ) -> CheckRecord {
        let record = CheckRecord {
            id: Uuid::new_v4(),
            project_id,
            name: name.to_string(),
            check_type: check_type.to_string(),
            config,
            schedule: schedule.to_string(),
            is_enabled,
            created_at: Utc::now(),
        };
        let mut inner = self.inner.lock().await;
        inner.checks.insert(record.id, record.clone());
        record
    }

    /// Mark a project as logically deleted.
    pub async fn delete_project(&self, id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(project) = inner.projects.get_mut(&id) {
            project.deleted_at = Some(Utc::now());
        }
    }

    /// Number of stored runs.
    pub async fn run_count(&self) -> usize {
        self.inner.lock().await.runs.len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_project(&self, id: Uuid) -> Result<Option<ProjectRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .projects
            .get(&id)
            .filter(|p| p.deleted_at.is_none())
            .cloned())
    }

    async fn get_check(&self, project_id: Uuid, check_id: Uuid) -> Result<Option<CheckRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .checks
            .get(&check_id)
            .filter(|c| c.project_id == project_id)
            .cloned())
    }

    async fn list_enabled_checks(&self) -> Result<Vec<(CheckRecord, ProjectRecord)>> {
        let inner = self.inner.lock().await;
        let mut pairs: Vec<(CheckRecord, ProjectRecord)> = inner
            .checks
            .values()
            .filter(|c| c.is_enabled)
            .filter_map(|c| {
                inner
                    .projects
                    .get(&c.project_id)
                    .filter(|p| p.deleted_at.is_none())
                    .map(|p| (c.clone(), p.clone()))
            })
            .collect();
        pairs.sort_by_key(|(c, _)| c.created_at);
        Ok(pairs)
    }

    async fn record_run(&self, check: &CheckRecord, run: NewCheckRun) -> Result<RunReport> {
        let mut inner = self.inner.lock().await;

        let run_id = Uuid::new_v4();
        let open = inner
            .incidents
            .iter()
            .find(|i| {
                i.project_id == check.project_id && i.check_id == check.id && i.state == STATE_OPEN
            })
            .cloned();

        let transition = incident::plan_transition(open.as_ref(), run.status);
        let (outcome, opened_incident_id) = match (transition, open) {
            (Transition::Open, _) => {
                let record = IncidentRecord {
                    id: Uuid::new_v4(),
                    project_id: check.project_id,
                    check_id: check.id,
                    title: incident::title_for(&check.name),
                    description: incident::description_for(run_id),
                    state: STATE_OPEN.to_string(),
                    consecutive_failures: 1,
                    first_seen_at: run.finished_at,
                    last_seen_at: run.finished_at,
                    resolved_at: None,
                    created_at: Utc::now(),
                };
                let id = record.id;
                inner.incidents.push(record);
                (IncidentOutcome::Opened(id), Some(id))
            }
            (Transition::Extend, Some(existing)) => {
                let mut consecutive_failures = existing.consecutive_failures;
                for candidate in inner.incidents.iter_mut() {
                    if candidate.id == existing.id {
                        candidate.consecutive_failures += 1;
                        candidate.last_seen_at = run.finished_at;
                        consecutive_failures = candidate.consecutive_failures;
                    }
                }
                (
                    IncidentOutcome::Extended {
                        id: existing.id,
                        consecutive_failures,
                    },
                    None,
                )
            }
            (Transition::Resolve, Some(existing)) => {
                for candidate in inner.incidents.iter_mut() {
                    if candidate.id == existing.id {
                        candidate.state = STATE_RESOLVED.to_string();
                        candidate.last_seen_at = run.finished_at;
                        candidate.resolved_at = Some(run.finished_at);
                    }
                }
                (IncidentOutcome::Resolved(existing.id), None)
            }
            _ => (IncidentOutcome::Unchanged, None),
        };

        let record = CheckRunRecord {
            id: run_id,
            project_id: check.project_id,
            check_id: check.id,
            status: run.status.as_str().to_string(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            latency_ms: run.latency_ms,
            http_status_code: run.http_status_code,
            result: run.result,
            error_message: run.error_message,
            opened_incident_id,
            created_at: Utc::now(),
        };
        inner.runs.insert(run_id, record);

        Ok(RunReport {
            run_id,
            incident: outcome,
        })
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<CheckRunRecord>> {
        Ok(self.inner.lock().await.runs.get(&id).cloned())
    }

    async fn open_incident(
        &self,
        project_id: Uuid,
        check_id: Uuid,
    ) -> Result<Option<IncidentRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .incidents
            .iter()
            .find(|i| i.project_id == project_id && i.check_id == check_id && i.state == STATE_OPEN)
            .cloned())
    }

    async fn list_incidents(
        &self,
        project_id: Uuid,
        check_id: Uuid,
    ) -> Result<Vec<IncidentRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .incidents
            .iter()
            .filter(|i| i.project_id == project_id && i.check_id == check_id)
            .cloned()
            .collect())
    }
}
