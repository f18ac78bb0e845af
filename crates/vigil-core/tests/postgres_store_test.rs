// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Postgres store integration tests.
//!
//! Require `TEST_DATABASE_URL`; each test skips silently when it is unset.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use vigil_core::envelope::RunStatus;
use vigil_core::incident::{STATE_OPEN, STATE_RESOLVED};
use vigil_core::store::{IncidentOutcome, NewCheckRun, Store};

mod common;
use common::TestContext;

fn new_run(status: RunStatus) -> NewCheckRun {
    let now = Utc::now();
    NewCheckRun {
        status,
        started_at: now,
        finished_at: now,
        latency_ms: Some(120),
        http_status_code: Some(200),
        result: json!({"status": status.as_str()}),
        error_message: String::new(),
    }
}

#[tokio::test]
async fn test_record_run_round_trip() {
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let project = ctx.add_project("acme", None).await;
    let check = ctx
        .add_check(project.id, "api", json!({}), "*/5 * * * *", true)
        .await;

    let report = ctx
        .store
        .record_run(&check, new_run(RunStatus::Pass))
        .await
        .unwrap();
    assert_eq!(report.incident, IncidentOutcome::Unchanged);

    let run = ctx
        .store
        .get_run(report.run_id)
        .await
        .unwrap()
        .expect("run stored");
    assert_eq!(run.status, "pass");
    assert_eq!(run.latency_ms, Some(120));
    assert_eq!(run.http_status_code, Some(200));
    assert_eq!(run.opened_incident_id, None);
}

#[tokio::test]
async fn test_incident_lifecycle_in_postgres() {
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let project = ctx.add_project("acme", None).await;
    let check = ctx
        .add_check(project.id, "db", json!({}), "* * * * *", true)
        .await;

    let report = ctx
        .store
        .record_run(&check, new_run(RunStatus::Fail))
        .await
        .unwrap();
    let opened_id = match report.incident {
        IncidentOutcome::Opened(id) => id,
        other => panic!("expected Opened, got {other:?}"),
    };
    let run = ctx.store.get_run(report.run_id).await.unwrap().unwrap();
    assert_eq!(run.opened_incident_id, Some(opened_id));

    let report = ctx
        .store
        .record_run(&check, new_run(RunStatus::Error))
        .await
        .unwrap();
    assert_eq!(
        report.incident,
        IncidentOutcome::Extended {
            id: opened_id,
            consecutive_failures: 2
        }
    );

    let report = ctx
        .store
        .record_run(&check, new_run(RunStatus::Pass))
        .await
        .unwrap();
    assert_eq!(report.incident, IncidentOutcome::Resolved(opened_id));
    assert!(
        ctx.store
            .open_incident(project.id, check.id)
            .await
            .unwrap()
            .is_none()
    );

    // New failure opens a fresh incident
    let report = ctx
        .store
        .record_run(&check, new_run(RunStatus::Fail))
        .await
        .unwrap();
    assert!(matches!(report.incident, IncidentOutcome::Opened(id) if id != opened_id));

    let incidents = ctx
        .store
        .list_incidents(project.id, check.id)
        .await
        .unwrap();
    assert_eq!(incidents.len(), 2);
    assert_eq!(incidents[0].state, STATE_RESOLVED);
    assert!(incidents[0].resolved_at.is_some());
    assert_eq!(incidents[1].state, STATE_OPEN);
}

#[tokio::test]
async fn test_check_lookup_is_project_scoped() {
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let project_a = ctx.add_project("a", None).await;
    let project_b = ctx.add_project("b", None).await;
    let check = ctx
        .add_check(project_a.id, "api", json!({}), "* * * * *", true)
        .await;

    assert!(
        ctx.store
            .get_check(project_a.id, check.id)
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        ctx.store
            .get_check(project_b.id, check.id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        ctx.store
            .get_check(project_a.id, Uuid::new_v4())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_deleted_projects_are_invisible() {
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let project = ctx.add_project("gone", Some("Europe/Amsterdam")).await;
    ctx.add_check(project.id, "api", json!({}), "* * * * *", true)
        .await;
    ctx.delete_project(project.id).await;

    assert!(ctx.store.get_project(project.id).await.unwrap().is_none());
    let enabled = ctx.store.list_enabled_checks().await.unwrap();
    assert!(enabled.iter().all(|(_, p)| p.id != project.id));
}
