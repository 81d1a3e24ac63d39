use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{Device, PageRequest, PagedResult, TelemetryMessage, TelemetryReading};
use crate::store::{DeviceStore, TelemetryStore};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_INSERT_ATTEMPTS: u32 = 5;

const SELECT_READING: &str = "SELECT id, device_id, value, metric_type, ts AS timestamp FROM telemetry";

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Telemetry history in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgTelemetryStore {
    pool: PgPool,
}

impl PgTelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, id: Uuid, message: &TelemetryMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO telemetry (id, device_id, ts, value, metric_type)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(message.device_id)
        .bind(message.timestamp)
        .bind(message.value)
        .bind(&message.metric_type)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TelemetryStore for PgTelemetryStore {
    async fn append(&self, message: &TelemetryMessage) -> Result<Uuid> {
        // The id is fixed before the first attempt so a retry after an
        // ambiguous failure cannot create a second row.
        let id = Uuid::new_v4();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.insert(id, message).await {
                Ok(()) => return Ok(id),
                Err(Error::Database(db_err)) if is_unique_violation(&db_err) && attempts > 1 => {
                    return Ok(id);
                }
                Err(Error::Database(db_err)) => {
                    DB_FAILURES_TOTAL.inc();
                    if attempts >= MAX_INSERT_ATTEMPTS || !is_transient_error(&db_err) {
                        error!(
                            "Database insert failed permanently after {} attempts: {}",
                            attempts, db_err
                        );
                        return Err(Error::Database(db_err));
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Database insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, MAX_INSERT_ATTEMPTS, wait_ms, db_err
                    );
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!("Database insert failed with non-database error: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn list_by_device(&self, device_id: Uuid) -> Result<Vec<TelemetryReading>> {
        let query = format!(
            "{} WHERE device_id = $1 ORDER BY ts DESC, id DESC",
            SELECT_READING
        );
        let rows = sqlx::query_as::<_, TelemetryReading>(&query)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn page(
        &self,
        device_id: Uuid,
        request: PageRequest,
    ) -> Result<PagedResult<TelemetryReading>> {
        // Count and slice inside one snapshot so concurrent appends cannot
        // make them disagree.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM telemetry WHERE device_id = $1")
            .bind(device_id)
            .fetch_one(&mut *tx)
            .await?;

        let query = format!(
            "{} WHERE device_id = $1 ORDER BY ts DESC, id DESC LIMIT $2 OFFSET $3",
            SELECT_READING
        );
        let items = sqlx::query_as::<_, TelemetryReading>(&query)
            .bind(device_id)
            .bind(request.page_size() as i64)
            .bind(i64::try_from(request.offset()).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(PagedResult {
            page: request.page(),
            page_size: request.page_size(),
            total_count: total.max(0) as u64,
            items,
        })
    }

    async fn latest(&self, count: u32) -> Result<Vec<TelemetryReading>> {
        let query = format!("{} ORDER BY ts DESC, id DESC LIMIT $1", SELECT_READING);
        let rows = sqlx::query_as::<_, TelemetryReading>(&query)
            .bind(count as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

/// Device registry table, read-only.
#[derive(Debug, Clone)]
pub struct PgDeviceStore {
    pool: PgPool,
}

impl PgDeviceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceStore for PgDeviceStore {
    async fn find(&self, id: Uuid) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, name, device_type, location FROM devices WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code == "23505"),
        _ => false,
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
