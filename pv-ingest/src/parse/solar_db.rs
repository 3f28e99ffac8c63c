//! Embedded SQLite (`.s3db`) logger archive.
//!
//! The reader library needs file-backed access, so the upload bytes are
//! staged to a `NamedTempFile` whose `Drop` removes it on every exit path,
//! including mid-parse errors. The database is opened read-only and the
//! `record` table is verified explicitly before any query runs.
//!
//! A `detail` column carries a compact `key:value;key:value` side channel
//! that expands into canonical metadata names (`p01` -> `dcPower1`, ...).
//! A closed set of device IDs identifies irradiance sensors; every other
//! device is an inverter whose primary numeric column is AC power. The set
//! is known to be incomplete in the field, so it is overridable rather than
//! inferred from data shape.

use std::collections::BTreeSet;
use std::io::Write;

use async_stream::stream;
use pv_client::domain::UnifiedMeasurement;
use rusqlite::{Connection, OpenFlags};

use crate::parse::fields::{self, GoldenMetric};
use crate::parse::{timestamp, value, FormatParser, MeasurementStream, ParseError};

pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

const NAME: &str = "solar-db";
const TABLE: &str = "record";

/// Device IDs whose primary value column is irradiance (W/m2).
pub const SENSOR_DEVICE_IDS: [i64; 3] = [250, 251, 252];

pub struct SolarDbParser {
    sensor_ids: BTreeSet<i64>,
}

impl SolarDbParser {
    pub fn new() -> Self {
        Self {
            sensor_ids: SENSOR_DEVICE_IDS.into_iter().collect(),
        }
    }

    /// Replaces the sensor-device classification for installations with
    /// sensor IDs outside the default set.
    pub fn with_sensor_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            sensor_ids: ids.into_iter().collect(),
        }
    }
}

impl Default for SolarDbParser {
    fn default() -> Self {
        Self::new()
    }
}

struct RawRow {
    timestamp: i64,
    device_id: i64,
    value: Option<f64>,
    day_sum: Option<f64>,
    status: Option<String>,
    detail: Option<String>,
}

/// Stages the bytes to a scoped temp file, reads all rows, and converts them.
/// Everything SQLite-related happens here so the connection and temp file are
/// released before the stream starts yielding.
fn read_database(
    data: &[u8],
    sensor_ids: &BTreeSet<i64>,
) -> Result<Vec<Result<UnifiedMeasurement, ParseError>>, ParseError> {
    if data.len() < SQLITE_MAGIC.len() || &data[..SQLITE_MAGIC.len()] != SQLITE_MAGIC {
        return Err(ParseError::file("not an SQLite database (bad magic bytes)"));
    }

    let mut staged = tempfile::NamedTempFile::new()
        .map_err(|e| ParseError::file(format!("failed to stage database: {e}")))?;
    staged
        .write_all(data)
        .and_then(|_| staged.flush())
        .map_err(|e| ParseError::file(format!("failed to stage database: {e}")))?;

    let conn = Connection::open_with_flags(staged.path(), OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| ParseError::file(format!("failed to open database: {e}")))?;

    let tables = list_tables(&conn)?;
    if !tables.iter().any(|t| t == TABLE) {
        return Err(ParseError::file(format!(
            "table '{TABLE}' not found; available tables: {}",
            tables.join(", ")
        )));
    }

    let mut stmt = conn
        .prepare(&format!(
            "SELECT timestamp, device_id, value, day_sum, status, detail \
             FROM {TABLE} ORDER BY timestamp"
        ))
        .map_err(|e| ParseError::file(format!("failed to read table '{TABLE}': {e}")))?;

    let rows = stmt
        .query_map([], |row| {
            Ok(RawRow {
                timestamp: row.get(0)?,
                device_id: row.get(1)?,
                value: row.get(2)?,
                day_sum: row.get(3)?,
                status: row.get(4)?,
                detail: row.get(5)?,
            })
        })
        .map_err(|e| ParseError::file(format!("failed to read table '{TABLE}': {e}")))?;

    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(raw) => out.push(convert_row(raw, sensor_ids)),
            Err(e) => out.push(Err(ParseError::row(format!("unreadable row: {e}")))),
        }
    }
    Ok(out)
}

fn list_tables(conn: &Connection) -> Result<Vec<String>, ParseError> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .map_err(|e| ParseError::file(format!("failed to list tables: {e}")))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| ParseError::file(format!("failed to list tables: {e}")))?
        .filter_map(Result::ok)
        .collect();
    Ok(names)
}

fn convert_row(
    raw: RawRow,
    sensor_ids: &BTreeSet<i64>,
) -> Result<UnifiedMeasurement, ParseError> {
    let ts = timestamp::parse_epoch_guarded(raw.timestamp).map_err(|e| ParseError::row(e.to_string()))?;

    let mut m = UnifiedMeasurement::new(ts, raw.device_id.to_string(), NAME);
    if sensor_ids.contains(&raw.device_id) {
        m.irradiance = raw.value;
    } else {
        m.active_power_watts = raw.value;
    }
    m.energy_daily_kwh = raw.day_sum;

    if let Some(status) = raw.status {
        if !value::is_sentinel(&status) {
            m.insert_metadata("status", value::metadata_value(&status));
        }
    }
    if let Some(detail) = raw.detail {
        decode_detail(&mut m, &detail);
    }
    Ok(m)
}

/// Expands the `key:value;key:value` side channel. Keys run through the same
/// canonical vocabulary as every other format; a golden-named key fills an
/// empty golden slot instead of shadowing it in metadata.
fn decode_detail(m: &mut UnifiedMeasurement, detail: &str) {
    for pair in detail.split(';') {
        let Some((key, raw)) = pair.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        match fields::golden_metric_for(key) {
            Some(GoldenMetric::ActivePower) if m.active_power_watts.is_none() => {
                m.active_power_watts = value::parse_metric(raw);
            }
            Some(GoldenMetric::EnergyDaily) if m.energy_daily_kwh.is_none() => {
                m.energy_daily_kwh = value::parse_metric(raw);
            }
            Some(GoldenMetric::Irradiance) if m.irradiance.is_none() => {
                m.irradiance = value::parse_metric(raw);
            }
            Some(_) => {}
            None => {
                m.insert_metadata(fields::normalize_key(key), value::metadata_value(raw));
            }
        }
    }
}

impl FormatParser for SolarDbParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Embedded SQLite (.s3db) logger archive with detail side-channel decoding"
    }

    fn can_handle(&self, filename: &str, snippet: &[u8]) -> bool {
        snippet.starts_with(SQLITE_MAGIC)
            || super::base_name(filename).to_lowercase().ends_with(".s3db")
    }

    fn parse(&self, _filename: &str, data: Vec<u8>) -> MeasurementStream {
        let sensor_ids = self.sensor_ids.clone();
        let s = stream! {
            let rows = match read_database(&data, &sensor_ids) {
                Ok(rows) => rows,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut emitted = 0usize;
            for row in rows {
                match row {
                    Ok(m) => {
                        emitted += 1;
                        yield Ok(m);
                    }
                    Err(e) => {
                        metrics::counter!("solar_db_parse_errors_total").increment(1);
                        yield Err(e);
                    }
                }
            }

            if emitted == 0 {
                yield Err(ParseError::file("no valid rows in database"));
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pv_client::domain::MetadataValue;
    use rusqlite::params;

    const TS: i64 = 1_700_000_000;

    fn database(setup: &str, rows: &[(i64, i64, Option<f64>, Option<f64>, Option<&str>, Option<&str>)]) -> Vec<u8> {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        {
            let conn = Connection::open(tmp.path()).unwrap();
            conn.execute_batch(setup).unwrap();
            for (ts, dev, value, day_sum, status, detail) in rows {
                conn.execute(
                    "INSERT INTO record (timestamp, device_id, value, day_sum, status, detail) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![ts, dev, value, day_sum, status, detail],
                )
                .unwrap();
            }
        }
        std::fs::read(tmp.path()).unwrap()
    }

    const SCHEMA: &str = "CREATE TABLE record (\
        timestamp INTEGER, device_id INTEGER, value REAL, \
        day_sum REAL, status TEXT, detail TEXT);";

    async fn collect(data: Vec<u8>) -> Vec<Result<UnifiedMeasurement, ParseError>> {
        SolarDbParser::new().parse("logger.s3db", data).collect().await
    }

    #[tokio::test]
    async fn inverter_rows_map_value_to_power() {
        let data = database(SCHEMA, &[(TS, 1, Some(1520.0), Some(3.2), None, None)]);
        let out = collect(data).await;
        let m = out[0].as_ref().unwrap();
        assert_eq!(m.logger_id, "1");
        assert_eq!(m.active_power_watts, Some(1520.0));
        assert_eq!(m.energy_daily_kwh, Some(3.2));
        assert_eq!(m.irradiance, None);
    }

    #[tokio::test]
    async fn sensor_device_ids_map_value_to_irradiance() {
        let data = database(SCHEMA, &[(TS, 250, Some(850.0), None, None, None)]);
        let out = collect(data).await;
        let m = out[0].as_ref().unwrap();
        assert_eq!(m.irradiance, Some(850.0));
        assert_eq!(m.active_power_watts, None);
    }

    #[tokio::test]
    async fn sensor_classification_is_overridable() {
        let data = database(SCHEMA, &[(TS, 7, Some(850.0), None, None, None)]);
        let out: Vec<_> = SolarDbParser::with_sensor_ids([7])
            .parse("logger.s3db", data)
            .collect()
            .await;
        let m = out[0].as_ref().unwrap();
        assert_eq!(m.irradiance, Some(850.0));
    }

    #[tokio::test]
    async fn detail_side_channel_expands_to_canonical_names() {
        let data = database(
            SCHEMA,
            &[(TS, 1, Some(1520.0), None, Some("4"), Some("p01:980;u02:380.5;err:4"))],
        );
        let out = collect(data).await;
        let m = out[0].as_ref().unwrap();
        assert_eq!(m.metadata.get("dcPower1"), Some(&MetadataValue::Number(980.0)));
        assert_eq!(m.metadata.get("dcVoltage2"), Some(&MetadataValue::Number(380.5)));
        assert_eq!(m.metadata.get("errorCode"), Some(&MetadataValue::Number(4.0)));
        assert_eq!(m.metadata.get("status"), Some(&MetadataValue::Number(4.0)));
    }

    #[tokio::test]
    async fn out_of_range_epochs_skip_the_row() {
        let data = database(
            SCHEMA,
            &[(100, 1, Some(1.0), None, None, None), (TS, 1, Some(2.0), None, None, None)],
        );
        let out = collect(data).await;
        assert!(matches!(out[0], Err(ParseError::Row(_))));
        assert!(out[1].is_ok());
    }

    #[tokio::test]
    async fn missing_table_error_lists_available_tables() {
        let data = {
            let tmp = tempfile::NamedTempFile::new().unwrap();
            {
                let conn = Connection::open(tmp.path()).unwrap();
                conn.execute_batch("CREATE TABLE history (x INTEGER);").unwrap();
            }
            std::fs::read(tmp.path()).unwrap()
        };
        let out = collect(data).await;
        match &out[0] {
            Err(ParseError::File(msg)) => {
                assert!(msg.contains("'record' not found"), "{msg}");
                assert!(msg.contains("history"), "{msg}");
            }
            other => panic!("expected file error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_sqlite_bytes_are_a_file_error() {
        let out = collect(b"definitely not sqlite".to_vec()).await;
        assert!(matches!(out[0], Err(ParseError::File(_))));
    }

    #[test]
    fn detects_magic_bytes_and_suffix() {
        let p = SolarDbParser::new();
        let mut magic = SQLITE_MAGIC.to_vec();
        magic.extend_from_slice(&[0u8; 16]);
        assert!(p.can_handle("whatever.bin", &magic));
        assert!(p.can_handle("logger.S3DB", b""));
        assert!(!p.can_handle("logger.csv", b"timestamp;a;b;c"));
    }
}
