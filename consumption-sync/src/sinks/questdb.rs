use std::time::Duration;

use meter_client::{db::consumption_queries, domain::FuelKind};
use sqlx::postgres::{PgPool, PgPoolOptions};
use time::OffsetDateTime;

use crate::{
    config::QuestDbConfig,
    pipeline::{SyncError, WatermarkStore},
};

/// Open the pgwire pool and make sure the server answers queries.
pub async fn connect(cfg: &QuestDbConfig) -> Result<PgPool, SyncError> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(Duration::from_secs(cfg.query_timeout_secs))
        .connect(&cfg.uri)
        .await
        .map_err(|e| SyncError::Connection(format!("failed to connect to QuestDB: {e}")))?;

    consumption_queries::ping(&pool)
        .await
        .map_err(|e| SyncError::Connection(format!("QuestDB health check failed: {e}")))?;

    Ok(pool)
}

/// Reads per-fuel watermarks from the points already stored in QuestDB.
pub struct QuestDbWatermarkStore {
    pool: PgPool,
    table: String,
    lookback: Option<time::Duration>,
    query_timeout: Duration,
}

impl QuestDbWatermarkStore {
    pub fn new(pool: PgPool, cfg: &QuestDbConfig) -> Self {
        Self {
            pool,
            table: cfg.table.clone(),
            lookback: i64::try_from(cfg.watermark_lookback_days)
                .ok()
                .and_then(|days| days.checked_mul(24 * 60 * 60))
                .map(time::Duration::seconds),
            query_timeout: Duration::from_secs(cfg.query_timeout_secs),
        }
    }
}

#[async_trait::async_trait]
impl WatermarkStore for QuestDbWatermarkStore {
    async fn last_reading_time(&self, fuel: FuelKind) -> Result<Option<OffsetDateTime>, SyncError> {
        let not_before = self
            .lookback
            .and_then(|lookback| OffsetDateTime::now_utc().checked_sub(lookback))
            .ok_or_else(|| SyncError::Query {
                fuel,
                message: "watermark lookback reaches outside the supported date range".to_string(),
            })?;

        let res = tokio::time::timeout(
            self.query_timeout,
            consumption_queries::last_reading_ts(&self.pool, &self.table, fuel, not_before),
        )
        .await;

        match res {
            Ok(Ok(last)) => {
                tracing::debug!(fuel_type = %fuel, last_submission = ?last, "Got last submission");
                Ok(last)
            }
            Ok(Err(e)) => Err(SyncError::Query {
                fuel,
                message: format!("{e:#}"),
            }),
            Err(_) => Err(SyncError::Query {
                fuel,
                message: format!("timed out after {:?}", self.query_timeout),
            }),
        }
    }
}
