use anyhow::{bail, Result};
use sqlx::PgPool;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::domain::FuelKind;

/// Designated timestamp column QuestDB creates for tables fed over ILP.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Tag (SYMBOL column) holding the fuel kind of each point.
pub const FUEL_TYPE_TAG: &str = "fuel_type";

/// Field holding the consumed amount of each point.
pub const CONSUMPTION_FIELD: &str = "consumption";

#[derive(Debug, Clone, sqlx::FromRow)]
struct LastReadingRow {
    ts: Option<PrimitiveDateTime>,
}

/// Table names are interpolated into SQL, so only plain identifiers are allowed.
pub fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        bail!("table name must not be empty");
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        bail!("table name '{name}' must start with a letter or underscore");
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("table name '{name}' may only contain letters, digits and underscores");
    }
    Ok(())
}

fn to_primitive_utc(ts: OffsetDateTime) -> PrimitiveDateTime {
    let utc = ts.to_offset(UtcOffset::UTC);
    PrimitiveDateTime::new(utc.date(), utc.time())
}

pub fn last_reading_sql(table: &str) -> String {
    format!(
        "SELECT max({TIMESTAMP_COLUMN}) AS ts FROM {table} \
         WHERE {FUEL_TYPE_TAG} = $1 AND {TIMESTAMP_COLUMN} >= $2"
    )
}

/// Round-trip a trivial query to prove the server is reachable and serving.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

pub async fn table_exists(pool: &PgPool, table: &str) -> Result<bool> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT table_name FROM tables() WHERE table_name = $1")
            .bind(table)
            .fetch_optional(pool)
            .await?;

    Ok(row.is_some())
}

/// Period start of the newest stored point for `fuel`, ignoring anything
/// older than `not_before`.
///
/// A table that does not exist yet has no history, so this returns `None`
/// rather than an error.
pub async fn last_reading_ts(
    pool: &PgPool,
    table: &str,
    fuel: FuelKind,
    not_before: OffsetDateTime,
) -> Result<Option<OffsetDateTime>> {
    validate_table_name(table)?;

    if !table_exists(pool, table).await? {
        return Ok(None);
    }

    let sql = last_reading_sql(table);
    let row = sqlx::query_as::<_, LastReadingRow>(&sql)
        .bind(fuel.as_str())
        .bind(to_primitive_utc(not_before))
        .fetch_one(pool)
        .await?;

    Ok(row.ts.map(PrimitiveDateTime::assume_utc))
}
