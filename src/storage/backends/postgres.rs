//! PostgreSQL attendee store
//!
//! Tables follow the layout of the original deployment: `attendees`,
//! `scraper_runs` and `attendee_changes`. A write session holds a
//! session-level advisory lock on a dedicated connection from before the run
//! is registered until after it is finalized, so two hosts sharing a database
//! get a single writer even though their lock files differ. A merge commits in
//! one transaction and is refused outside a write session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::merger::{MergePlan, WriteKind};
use crate::model::{
    AttendeeChange, AttendeeProfile, NewRun, RunRecord, RunStatus, StoreStatistics,
    StoredAttendee,
};
use crate::storage::config::StorageConfig;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::AttendeeStore;

/// Advisory lock key shared by every writer against the same database
const MERGE_LOCK_KEY: i64 = 0x726f_7374_6572;

pub struct PostgresStore {
    pool: PgPool,
    schema: String,
    /// Connection holding the writer advisory lock during a write session
    writer: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PostgresStore {
    pub async fn connect(config: &StorageConfig) -> StorageResult<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StorageError::configuration("database_url is required for postgres"))?;
        info!(schema = %config.schema, "Connecting to PostgreSQL store");

        let options = PgConnectOptions::from_str(url)
            .map_err(|e| StorageError::connection(format!("Invalid connection string: {}", e)))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.connection_timeout)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::connection(format!("Failed to connect to database: {}", e)))?;

        let store = Self {
            pool,
            schema: config.schema.clone(),
            writer: Mutex::new(None),
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    async fn initialize_schema(&self) -> StorageResult<()> {
        let profile_columns: String = AttendeeProfile::FIELDS
            .iter()
            .filter(|(name, _)| *name != "email" && *name != "user_id")
            .map(|(name, _)| format!("{} TEXT,\n", name))
            .collect();

        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {runs} (
                    id BIGSERIAL PRIMARY KEY,
                    run_timestamp TIMESTAMPTZ NOT NULL UNIQUE,
                    run_date DATE NOT NULL,
                    total_attendees BIGINT NOT NULL DEFAULT 0,
                    new_attendees BIGINT NOT NULL DEFAULT 0,
                    updated_attendees BIGINT NOT NULL DEFAULT 0,
                    status TEXT NOT NULL CHECK (status IN ('completed', 'failed', 'partial')),
                    error_message TEXT,
                    metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    finished_at TIMESTAMPTZ
                )
                "#,
                runs = self.table("scraper_runs")
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {attendees} (
                    id TEXT PRIMARY KEY,
                    user_id TEXT UNIQUE DEFERRABLE INITIALLY DEFERRED,
                    email TEXT NOT NULL UNIQUE DEFERRABLE INITIALLY DEFERRED,
                    {profile_columns}
                    detail_available BOOLEAN NOT NULL DEFAULT TRUE,
                    first_seen_at TIMESTAMPTZ NOT NULL,
                    last_updated_at TIMESTAMPTZ NOT NULL,
                    update_count INTEGER NOT NULL DEFAULT 0,
                    last_seen_run_id BIGINT REFERENCES {runs}(id),
                    raw_data JSONB
                )
                "#,
                attendees = self.table("attendees"),
                runs = self.table("scraper_runs"),
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {changes} (
                    id BIGSERIAL PRIMARY KEY,
                    attendee_id TEXT NOT NULL REFERENCES {attendees}(id),
                    run_id BIGINT NOT NULL REFERENCES {runs}(id),
                    field_name TEXT NOT NULL,
                    old_value TEXT,
                    new_value TEXT,
                    changed_at TIMESTAMPTZ NOT NULL
                )
                "#,
                changes = self.table("attendee_changes"),
                attendees = self.table("attendees"),
                runs = self.table("scraper_runs"),
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_attendee_changes_attendee ON {} (attendee_id)",
                self.table("attendee_changes")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_attendee_changes_run ON {} (run_id)",
                self.table("attendee_changes")
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("PostgreSQL schema ready");
        Ok(())
    }

    fn upsert_sql(&self, insert_only: bool) -> String {
        let mut columns: Vec<&str> = vec!["id"];
        columns.extend(AttendeeProfile::FIELDS.iter().map(|(name, _)| *name));
        columns.extend([
            "detail_available",
            "first_seen_at",
            "last_updated_at",
            "update_count",
            "last_seen_run_id",
            "raw_data",
        ]);
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table("attendees"),
            columns.join(", "),
            placeholders.join(", ")
        );
        if !insert_only {
            let updates: Vec<String> = columns[1..]
                .iter()
                .map(|c| format!("{c} = EXCLUDED.{c}"))
                .collect();
            sql.push_str(&format!(" ON CONFLICT (id) DO UPDATE SET {}", updates.join(", ")));
        }
        sql
    }

    async fn write_attendee(
        tx: &mut Transaction<'_, Postgres>,
        sql: &str,
        row: &StoredAttendee,
    ) -> StorageResult<()> {
        let mut query = sqlx::query(sql).bind(&row.id);
        for (_, value) in row.profile.values() {
            query = query.bind(value);
        }
        query
            .bind(row.detail_available)
            .bind(row.first_seen_at)
            .bind(row.last_updated_at)
            .bind(row.update_count as i32)
            .bind(row.last_seen_run_id)
            .bind(Json(&row.raw_data))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    fn select_attendees(&self, filter: &str) -> String {
        format!("SELECT * FROM {} WHERE {}", self.table("attendees"), filter)
    }

    fn select_changes(&self, column: &str) -> String {
        format!(
            "SELECT * FROM {} WHERE {} = $1 ORDER BY id",
            self.table("attendee_changes"),
            column
        )
    }
}

fn attendee_from_row(row: &PgRow) -> StorageResult<StoredAttendee> {
    let mut profile = AttendeeProfile::default();
    for (name, _) in AttendeeProfile::FIELDS {
        profile.set(name, row.try_get::<Option<String>, _>(*name)?);
    }
    let raw: Option<Json<Value>> = row.try_get("raw_data")?;
    Ok(StoredAttendee {
        id: row.try_get("id")?,
        profile,
        detail_available: row.try_get("detail_available")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_updated_at: row.try_get("last_updated_at")?,
        update_count: row.try_get::<i32, _>("update_count")?.max(0) as u32,
        last_seen_run_id: row.try_get::<Option<i64>, _>("last_seen_run_id")?.unwrap_or_default(),
        raw_data: raw.map(|j| j.0).unwrap_or(Value::Null),
    })
}

fn run_from_row(row: &PgRow) -> StorageResult<RunRecord> {
    let status: String = row.try_get("status")?;
    let metadata: Json<Value> = row.try_get("metadata")?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        run_timestamp: row.try_get("run_timestamp")?,
        total_attendees: row.try_get::<i64, _>("total_attendees")?.max(0) as u64,
        new_attendees: row.try_get::<i64, _>("new_attendees")?.max(0) as u64,
        updated_attendees: row.try_get::<i64, _>("updated_attendees")?.max(0) as u64,
        status: RunStatus::from_str(&status).map_err(StorageError::serialization)?,
        error_message: row.try_get("error_message")?,
        metadata: metadata.0,
        finished_at: row.try_get("finished_at")?,
    })
}

fn change_from_row(row: &PgRow) -> StorageResult<AttendeeChange> {
    Ok(AttendeeChange {
        id: row.try_get("id")?,
        attendee_id: row.try_get("attendee_id")?,
        run_id: row.try_get("run_id")?,
        field_name: row.try_get("field_name")?,
        old_value: row.try_get("old_value")?,
        new_value: row.try_get("new_value")?,
        changed_at: row.try_get("changed_at")?,
    })
}

#[async_trait]
impl AttendeeStore for PostgresStore {
    async fn begin_write_session(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(MERGE_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;
        if !locked {
            return Err(StorageError::lock(
                "another writer holds the database advisory lock",
            ));
        }
        debug!("Acquired database writer lock");
        *writer = Some(conn);
        Ok(())
    }

    async fn end_write_session(&self) -> StorageResult<()> {
        let Some(mut conn) = self.writer.lock().await.take() else {
            return Ok(());
        };
        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(MERGE_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await;
        match unlocked {
            Ok(_) => {
                debug!("Released database writer lock");
                Ok(())
            }
            Err(e) => {
                // Closing the session releases its advisory locks
                warn!("Could not release database writer lock, closing connection: {}", e);
                drop(conn.detach());
                Err(e.into())
            }
        }
    }

    async fn register_run(&self, run: &NewRun) -> StorageResult<RunRecord> {
        let metadata = if run.metadata.is_object() {
            run.metadata.clone()
        } else {
            serde_json::json!({})
        };
        let sql = format!(
            r#"
            INSERT INTO {runs} (run_timestamp, run_date, total_attendees, status, metadata)
            VALUES ($1, $2, $3, 'partial', $4)
            ON CONFLICT (run_timestamp) DO UPDATE SET
                status = 'partial',
                error_message = NULL,
                finished_at = NULL,
                total_attendees = EXCLUDED.total_attendees,
                metadata = {runs}.metadata || EXCLUDED.metadata
            RETURNING *
            "#,
            runs = self.table("scraper_runs")
        );
        let row = sqlx::query(&sql)
            .bind(run.run_timestamp)
            .bind(run.run_timestamp.date_naive())
            .bind(run.total_attendees as i64)
            .bind(Json(metadata))
            .fetch_one(&self.pool)
            .await?;
        run_from_row(&row)
    }

    async fn load_attendees(&self, ids: &[String]) -> StorageResult<HashMap<String, StoredAttendee>> {
        let sql = self.select_attendees("id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| attendee_from_row(row).map(|a| (a.id.clone(), a)))
            .collect()
    }

    async fn email_owners(&self, emails: &[String]) -> StorageResult<HashMap<String, String>> {
        let sql = format!(
            "SELECT email, id FROM {} WHERE email = ANY($1)",
            self.table("attendees")
        );
        let rows = sqlx::query(&sql)
            .bind(emails.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("email")?, row.try_get("id")?)))
            .collect()
    }

    async fn commit_merge(&self, plan: &MergePlan) -> StorageResult<RunRecord> {
        if self.writer.lock().await.is_none() {
            return Err(StorageError::lock(
                "merge attempted outside a database write session",
            ));
        }
        let mut tx = self.pool.begin().await?;

        let status: Option<String> = sqlx::query_scalar(&format!(
            "SELECT status FROM {} WHERE id = $1 FOR UPDATE",
            self.table("scraper_runs")
        ))
        .bind(plan.run_id)
        .fetch_optional(&mut *tx)
        .await?;
        match status.as_deref() {
            None => return Err(StorageError::not_found(format!("run {}", plan.run_id))),
            Some("partial") => {}
            Some(other) => {
                return Err(StorageError::conflict(format!(
                    "run {} is {}, expected partial",
                    plan.run_id, other
                )))
            }
        }

        let insert_sql = self.upsert_sql(true);
        let upsert_sql = self.upsert_sql(false);
        for write in &plan.writes {
            let sql = match write.kind {
                WriteKind::Insert => &insert_sql,
                _ => &upsert_sql,
            };
            Self::write_attendee(&mut tx, sql, &write.row).await?;
        }

        let change_sql = format!(
            "INSERT INTO {} (attendee_id, run_id, field_name, old_value, new_value, changed_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.table("attendee_changes")
        );
        for change in &plan.changes {
            sqlx::query(&change_sql)
                .bind(&change.attendee_id)
                .bind(plan.run_id)
                .bind(&change.field_name)
                .bind(&change.old_value)
                .bind(&change.new_value)
                .bind(plan.merged_at)
                .execute(&mut *tx)
                .await?;
        }

        let finalize = format!(
            r#"
            UPDATE {runs} SET
                total_attendees = $2,
                new_attendees = $3,
                updated_attendees = $4,
                status = 'completed',
                error_message = NULL,
                finished_at = NOW(),
                metadata = metadata || $5
            WHERE id = $1
            RETURNING *
            "#,
            runs = self.table("scraper_runs")
        );
        let row = sqlx::query(&finalize)
            .bind(plan.run_id)
            .bind(plan.counts.total as i64)
            .bind(plan.counts.new as i64)
            .bind(plan.counts.updated as i64)
            .bind(Json(&plan.metadata))
            .fetch_one(&mut *tx)
            .await?;

        // Deferred unique constraints are checked here
        tx.commit().await?;
        run_from_row(&row)
    }

    async fn fail_run(&self, run_id: i64, error: &str) -> StorageResult<RunRecord> {
        let sql = format!(
            "UPDATE {} SET status = 'failed', error_message = $2, finished_at = NOW() \
             WHERE id = $1 RETURNING *",
            self.table("scraper_runs")
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .bind(error)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("run {}", run_id)))?;
        run_from_row(&row)
    }

    async fn get_attendee(&self, id: &str) -> StorageResult<Option<StoredAttendee>> {
        let sql = self.select_attendees("id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(attendee_from_row)
            .transpose()
    }

    async fn get_run(&self, run_id: i64) -> StorageResult<Option<RunRecord>> {
        let sql = format!("SELECT * FROM {} WHERE id = $1", self.table("scraper_runs"));
        sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(run_from_row)
            .transpose()
    }

    async fn latest_completed_run(&self) -> StorageResult<Option<RunRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE status = 'completed' ORDER BY run_timestamp DESC LIMIT 1",
            self.table("scraper_runs")
        );
        sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(run_from_row)
            .transpose()
    }

    async fn changes_for_attendee(&self, attendee_id: &str) -> StorageResult<Vec<AttendeeChange>> {
        let sql = self.select_changes("attendee_id");
        let rows = sqlx::query(&sql)
            .bind(attendee_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(change_from_row).collect()
    }

    async fn changes_for_run(&self, run_id: i64) -> StorageResult<Vec<AttendeeChange>> {
        let sql = self.select_changes("run_id");
        let rows = sqlx::query(&sql).bind(run_id).fetch_all(&self.pool).await?;
        rows.iter().map(change_from_row).collect()
    }

    async fn new_attendees_in_run(&self, run_id: i64) -> StorageResult<Vec<StoredAttendee>> {
        let filter = format!(
            "first_seen_at = (SELECT run_timestamp FROM {} WHERE id = $1)",
            self.table("scraper_runs")
        );
        let sql = self.select_attendees(&filter);
        let rows = sqlx::query(&sql).bind(run_id).fetch_all(&self.pool).await?;
        rows.iter().map(attendee_from_row).collect()
    }

    async fn statistics(&self) -> StorageResult<StoreStatistics> {
        let sql = format!(
            r#"
            SELECT
                (SELECT COUNT(*) FROM {a}) AS total_attendees,
                (SELECT COUNT(DISTINCT NULLIF(organization, '')) FROM {a}) AS unique_organizations,
                (SELECT COUNT(DISTINCT NULLIF(detail_country, '')) FROM {a}) AS unique_countries,
                (SELECT COUNT(DISTINCT NULLIF(detail_industry, '')) FROM {a}) AS unique_industries,
                (SELECT COUNT(*) FROM {a} WHERE NOT detail_available) AS detail_unavailable,
                (SELECT COUNT(*) FROM {r}) AS total_runs,
                (SELECT COUNT(*) FROM {r} WHERE status = 'completed') AS completed_runs,
                (SELECT COUNT(*) FROM {c}) AS total_changes,
                (SELECT MAX(run_timestamp) FROM {r} WHERE status = 'completed') AS latest_completed_run
            "#,
            a = self.table("attendees"),
            r = self.table("scraper_runs"),
            c = self.table("attendee_changes"),
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let count = |name: &str| -> StorageResult<u64> {
            Ok(row.try_get::<i64, _>(name)?.max(0) as u64)
        };
        Ok(StoreStatistics {
            total_attendees: count("total_attendees")?,
            unique_organizations: count("unique_organizations")?,
            unique_countries: count("unique_countries")?,
            unique_industries: count("unique_industries")?,
            detail_unavailable: count("detail_unavailable")?,
            total_runs: count("total_runs")?,
            completed_runs: count("completed_runs")?,
            total_changes: count("total_changes")?,
            latest_completed_run: row.try_get("latest_completed_run")?,
        })
    }

    async fn purge_changes_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE changed_at < $1",
            self.table("attendee_changes")
        );
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
