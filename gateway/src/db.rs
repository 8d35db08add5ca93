use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{
    CommandId, CommandUpdate, NewCommand, StationCertificate, StationId, StationRef,
    TelemetrySample,
};
use crate::persistence::{CredentialProvider, Persistence};

const MAX_ATTEMPTS: u32 = 5;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed [`Persistence`] and [`CredentialProvider`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(make_pool(database_url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Runs `query` again with exponential backoff while it fails with a
/// transient database error.
async fn with_retry<T, F, Fut>(operation: &str, mut query: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match query().await {
            Ok(value) => return Ok(value),
            Err(Error::Database(db_err))
                if attempts < MAX_ATTEMPTS && is_transient_error(&db_err) =>
            {
                let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    operation, attempts, MAX_ATTEMPTS, wait_ms, db_err
                );
                DB_FAILURES_TOTAL.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
            Err(e) => {
                error!("{} failed after {} attempt(s): {}", operation, attempts, e);
                return Err(e);
            }
        }
    }
}

#[async_trait]
impl Persistence for PgStore {
    async fn save_telemetry(&self, sample: &TelemetrySample) -> Result<()> {
        with_retry("Telemetry insert", move || async move {
            sqlx::query(
                r#"
                INSERT INTO telemetry (
                    station_id, recorded_at, temperature, humidity, pressure, heat_index,
                    wind_direction, wind_speed, precipitation, uv_index, distance, light_intensity
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (station_id, recorded_at) DO NOTHING
                "#,
            )
            .bind(sample.station_id)
            .bind(sample.recorded_at)
            .bind(sample.temperature)
            .bind(sample.humidity)
            .bind(sample.pressure)
            .bind(sample.heat_index)
            .bind(sample.wind_direction)
            .bind(sample.wind_speed)
            .bind(sample.precipitation)
            .bind(sample.uv_index)
            .bind(sample.distance)
            .bind(sample.light_intensity)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn create_command(&self, command: &NewCommand) -> Result<CommandId> {
        with_retry("Command insert", move || async move {
            let id: CommandId = sqlx::query_scalar(
                r#"
                INSERT INTO commands (station_id, type, payload, status, issued_by, created_at)
                VALUES ($1, $2, $3, 'PENDING', $4, $5)
                RETURNING id
                "#,
            )
            .bind(command.station_id)
            .bind(command.command_type.as_str())
            .bind(&command.payload)
            .bind(command.issued_by)
            .bind(command.created_at)
            .fetch_one(&self.pool)
            .await?;
            Ok(id)
        })
        .await
    }

    async fn update_command_status(&self, id: CommandId, update: &CommandUpdate) -> Result<()> {
        let updated = with_retry("Command update", move || async move {
            let result = sqlx::query(
                r#"
                UPDATE commands
                SET status = $2, sent_at = $3, executed_at = $4, response = $5
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(update.status.as_str())
            .bind(update.sent_at)
            .bind(update.executed_at)
            .bind(&update.response)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(Error::NotFound(format!("command {}", id)));
        }
        Ok(())
    }

    async fn get_active_stations(&self) -> Result<Vec<StationRef>> {
        with_retry("Station query", move || async move {
            let stations = sqlx::query_as::<_, StationRef>(
                r#"
                SELECT id, serial_code, organization_id
                FROM stations
                WHERE active
                ORDER BY id
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(stations)
        })
        .await
    }
}

#[async_trait]
impl CredentialProvider for PgStore {
    async fn get_station_certificate(&self, station_id: StationId) -> Result<StationCertificate> {
        let row = with_retry("Certificate query", move || async move {
            let row = sqlx::query(
                r#"
                SELECT certificate_pem, private_key_pem, root_ca_pem
                FROM station_certificates
                WHERE station_id = $1 AND revoked_at IS NULL
                ORDER BY issued_at DESC
                LIMIT 1
                "#,
            )
            .bind(station_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await?;

        let row = row.ok_or_else(|| {
            Error::Credential(format!("no active certificate for station {}", station_id))
        })?;

        Ok(StationCertificate {
            cert_pem: row.try_get::<String, _>("certificate_pem")?.into_bytes(),
            key_pem: row.try_get::<String, _>("private_key_pem")?.into_bytes(),
            root_ca_pem: row.try_get::<String, _>("root_ca_pem")?.into_bytes(),
        })
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}
