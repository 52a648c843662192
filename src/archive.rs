use crate::error::ArchiveError;
use crate::telemetry::TelemetryRecord;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json as SqlJson;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};

// Four bind parameters per row keeps a full batch under the Postgres limit of 65535.
pub const MAX_ROWS_PER_WRITE: usize = 10_000;

/// Destination for flushed batches. Implementations must accept the same batch
/// more than once, since failed writes are retried with identical content.
#[async_trait]
pub trait ArchiveStore: Send + Sync + 'static {
    async fn write_batch(&self, records: &[TelemetryRecord]) -> Result<(), ArchiveError>;
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgArchiveStore {
    pool: PgPool,
}

impl PgArchiveStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry_archive (
                device_id text not null,
                ts timestamptz not null,
                payload jsonb not null default '{}'::jsonb,
                inserted_at timestamptz not null default now(),
                primary key (device_id, ts)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for PgArchiveStore {
    async fn write_batch(&self, records: &[TelemetryRecord]) -> Result<(), ArchiveError> {
        if records.is_empty() {
            return Ok(());
        }
        if records.len() > MAX_ROWS_PER_WRITE {
            return Err(ArchiveError::Rejected(format!(
                "batch of {} rows exceeds {MAX_ROWS_PER_WRITE}",
                records.len()
            )));
        }

        let inserted_at = Utc::now();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO telemetry_archive (device_id, ts, payload, inserted_at) ",
        );
        builder.push_values(records.iter(), |mut b, record| {
            b.push_bind(record.device_id.clone())
                .push_bind(record.timestamp)
                .push_bind(SqlJson(record.payload.clone()))
                .push_bind(inserted_at);
        });
        builder.push(" ON CONFLICT DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        let inserted = result.rows_affected() as usize;
        if inserted < records.len() {
            tracing::debug!(
                inserted,
                skipped = records.len().saturating_sub(inserted),
                "skipped duplicate archive rows"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::env;

    async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Ok(pool)
    }

    #[tokio::test]
    async fn test_write_batch_is_idempotent() -> Result<()> {
        if env::var("RELAY_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(());
        }
        let database_url = match env::var("RELAY_TEST_DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return Ok(()),
        };
        let schema = format!("relay_test_archive_{}", std::process::id());
        let pool = setup_test_pool(&database_url, &schema).await?;
        let store = PgArchiveStore::new(pool.clone());
        store.ensure_schema().await?;

        let base = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let records: Vec<TelemetryRecord> = (0..3)
            .map(|i| TelemetryRecord {
                device_id: "esp32-01".to_string(),
                timestamp: base + chrono::Duration::seconds(i),
                payload: json!({"humidity": 40 + i})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();

        store.write_batch(&records).await?;
        store.write_batch(&records).await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM telemetry_archive")
            .fetch_one(&pool)
            .await?;
        assert_eq!(count, 3);

        let humidity: i64 = sqlx::query_scalar(
            "SELECT (payload->>'humidity')::bigint FROM telemetry_archive ORDER BY ts DESC LIMIT 1",
        )
        .fetch_one(&pool)
        .await?;
        assert_eq!(humidity, 42);

        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await?;
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .execute(&admin_pool)
            .await;

        Ok(())
    }
}
