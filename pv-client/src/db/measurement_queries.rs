use std::collections::BTreeMap;

use anyhow::Result;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::domain::{MetadataValue, UnifiedMeasurement};

/// Row shape of `unified_measurements`. Column names are quoted camelCase to
/// stay compatible with the dashboard services reading the same table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct MeasurementRow {
    timestamp: OffsetDateTime,
    #[sqlx(rename = "loggerId")]
    logger_id: String,
    #[sqlx(rename = "loggerType")]
    logger_type: String,
    #[sqlx(rename = "activePowerWatts")]
    active_power_watts: Option<f64>,
    #[sqlx(rename = "energyDailyKwh")]
    energy_daily_kwh: Option<f64>,
    irradiance: Option<f64>,
    metadata: Json<BTreeMap<String, MetadataValue>>,
}

impl From<MeasurementRow> for UnifiedMeasurement {
    fn from(r: MeasurementRow) -> Self {
        UnifiedMeasurement {
            timestamp: r.timestamp,
            logger_id: r.logger_id,
            logger_type: r.logger_type,
            active_power_watts: r.active_power_watts,
            energy_daily_kwh: r.energy_daily_kwh,
            irradiance: r.irradiance,
            metadata: r.metadata.0,
        }
    }
}

/// Batch upsert keyed on `("loggerId", "timestamp")`. Conflicting rows have
/// all non-key columns replaced by the new values (last write wins). Returns
/// the number of rows written, counting both inserts and updates.
pub async fn upsert_measurements(pool: &PgPool, batch: &[UnifiedMeasurement]) -> Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        r#"INSERT INTO unified_measurements
            ("timestamp", "loggerId", "loggerType",
             "activePowerWatts", "energyDailyKwh", "irradiance", "metadata") "#,
    );

    builder.push_values(batch, |mut b, m| {
        b.push_bind(m.timestamp)
            .push_bind(&m.logger_id)
            .push_bind(&m.logger_type)
            .push_bind(m.active_power_watts)
            .push_bind(m.energy_daily_kwh)
            .push_bind(m.irradiance)
            .push_bind(Json(&m.metadata));
    });

    builder.push(
        r#" ON CONFLICT ("loggerId", "timestamp") DO UPDATE SET
            "loggerType" = EXCLUDED."loggerType",
            "activePowerWatts" = EXCLUDED."activePowerWatts",
            "energyDailyKwh" = EXCLUDED."energyDailyKwh",
            "irradiance" = EXCLUDED."irradiance",
            "metadata" = EXCLUDED."metadata""#,
    );

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Fetch a time-ordered window of measurements for a single logger.
pub async fn measurement_window(
    pool: &PgPool,
    logger_id: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<UnifiedMeasurement>> {
    let rows = sqlx::query_as::<_, MeasurementRow>(
        r#"
        SELECT
            "timestamp",
            "loggerId",
            "loggerType",
            "activePowerWatts",
            "energyDailyKwh",
            "irradiance",
            "metadata"
        FROM unified_measurements
        WHERE "loggerId" = $1
          AND "timestamp" >= $2
          AND "timestamp" <  $3
        ORDER BY "timestamp"
        "#,
    )
    .bind(logger_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(UnifiedMeasurement::from).collect())
}

/// Most recent measurement for a logger, if any.
pub async fn latest_measurement(
    pool: &PgPool,
    logger_id: &str,
) -> Result<Option<UnifiedMeasurement>> {
    let row = sqlx::query_as::<_, MeasurementRow>(
        r#"
        SELECT
            "timestamp",
            "loggerId",
            "loggerType",
            "activePowerWatts",
            "energyDailyKwh",
            "irradiance",
            "metadata"
        FROM unified_measurements
        WHERE "loggerId" = $1
        ORDER BY "timestamp" DESC
        LIMIT 1
        "#,
    )
    .bind(logger_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(UnifiedMeasurement::from))
}
