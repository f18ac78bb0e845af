// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for vigil-core integration tests.
//!
//! Postgres-backed tests are gated on `TEST_DATABASE_URL`; when it is not
//! set they skip silently so the suite stays runnable without a database.

#![allow(dead_code)]

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use vigil_core::store::postgres::{self, PostgresStore};
use vigil_core::store::{CheckRecord, ProjectRecord};

/// Test context holding a database pool and a store over it.
pub struct TestContext {
    pub pool: PgPool,
    pub store: PostgresStore,
}

impl TestContext {
    /// Connect to the test database, or None to skip the test.
    pub async fn new() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;
        postgres::ensure_schema(&pool).await.ok()?;
        Some(Self {
            store: PostgresStore::new(pool.clone()),
            pool,
        })
    }

    /// Insert a project row.
    pub async fn add_project(&self, name: &str, timezone: Option<&str>) -> ProjectRecord {
        let record = ProjectRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            timezone: timezone.map(str::to_string),
            created_at: Utc::now(),
            deleted_at: None,
        };
        sqlx::query(
            "INSERT INTO projects (id, name, timezone, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.timezone)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .expect("insert project");
        record
    }

    /// Insert a check row.
    pub async fn add_check(
        &self,
        project_id: Uuid,
        name: &str,
        config: Value,
        schedule: &str,
        is_enabled: bool,
    ) -> CheckRecord {
        let record = CheckRecord {
            id: Uuid::new_v4(),
            project_id,
            name: name.to_string(),
            check_type: "http".to_string(),
            config,
            schedule: schedule.to_string(),
            is_enabled,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO checks (id, project_id, name, type, config, schedule, is_enabled, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.project_id)
        .bind(&record.name)
        .bind(&record.check_type)
        .bind(&record.config)
        .bind(&record.schedule)
        .bind(record.is_enabled)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .expect("insert check");
        record
    }

    /// Mark a project as logically deleted.
    pub async fn delete_project(&self, id: Uuid) {
        sqlx::query("UPDATE projects SET deleted_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .expect("delete project");
    }
}
