//! Headerless entity-attribute-value CSV: four fixed columns
//! (timestamp, logger id, metric key, value), one metric per row. Rows are
//! pivoted into one record per `(timestamp, logger)` group.
//!
//! This is the loosest grammar in the registry and must stay the last
//! registered parser: its detection accepts any delimited file whose first
//! row starts with a parsable timestamp.

use std::collections::HashMap;

use async_stream::stream;
use pv_client::domain::UnifiedMeasurement;
use time::OffsetDateTime;

use crate::parse::fields::{self, GoldenMetric};
use crate::parse::{timestamp, value, FormatParser, MeasurementStream, ParseError};

pub struct EavCsvParser;

const NAME: &str = "eav-csv";

fn detect_delimiter(line: &str) -> u8 {
    if line.contains(';') {
        b';'
    } else {
        b','
    }
}

/// Per-group pivot state. `claimed` marks golden slots that already consumed
/// a key; the first mapping wins even when it carried a sentinel, so later
/// duplicates cannot resurrect the slot.
struct PivotGroup {
    measurement: UnifiedMeasurement,
    claimed: [bool; 3],
}

impl PivotGroup {
    fn apply(&mut self, raw_key: &str, raw_value: &str) {
        match fields::golden_metric_for(raw_key) {
            Some(metric) => {
                let slot_index = match metric {
                    GoldenMetric::ActivePower => 0,
                    GoldenMetric::EnergyDaily => 1,
                    GoldenMetric::Irradiance => 2,
                };
                if self.claimed[slot_index] {
                    return;
                }
                self.claimed[slot_index] = true;
                let parsed = value::parse_metric(raw_value);
                match metric {
                    GoldenMetric::ActivePower => self.measurement.active_power_watts = parsed,
                    GoldenMetric::EnergyDaily => self.measurement.energy_daily_kwh = parsed,
                    GoldenMetric::Irradiance => self.measurement.irradiance = parsed,
                }
            }
            None => {
                self.measurement
                    .insert_metadata(fields::normalize_key(raw_key), value::metadata_value(raw_value));
            }
        }
    }
}

impl FormatParser for EavCsvParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Headerless timestamp/logger/key/value CSV, pivoted to one record per timestamp and logger"
    }

    fn can_handle(&self, _filename: &str, snippet: &[u8]) -> bool {
        let text = String::from_utf8_lossy(snippet);
        let Some(line) = text.lines().find(|l| !l.trim().is_empty()) else {
            return false;
        };
        let delim = detect_delimiter(line) as char;
        let cells: Vec<&str> = line.split(delim).collect();
        cells.len() == 4 && timestamp::parse_any(cells[0]).is_ok()
    }

    fn parse(&self, _filename: &str, data: Vec<u8>) -> MeasurementStream {
        let s = stream! {
            let text = String::from_utf8_lossy(&data);
            let delim = text
                .lines()
                .find(|l| !l.trim().is_empty())
                .map(detect_delimiter)
                .unwrap_or(b';');

            let mut rdr = csv::ReaderBuilder::new()
                .has_headers(false)
                .delimiter(delim)
                .flexible(true)
                .trim(csv::Trim::All)
                .from_reader(data.as_slice());

            // Whole-file pivot: vendor exports interleave loggers, so grouping
            // only consecutive rows would emit duplicate natural keys.
            let mut order: Vec<(String, OffsetDateTime)> = Vec::new();
            let mut groups: HashMap<(String, OffsetDateTime), PivotGroup> = HashMap::new();

            for result in rdr.records() {
                let record = match result {
                    Ok(r) => r,
                    Err(e) => {
                        metrics::counter!("eav_csv_parse_errors_total").increment(1);
                        yield Err(ParseError::row(format!("unreadable CSV row: {e}")));
                        continue;
                    }
                };
                if record.len() == 1 && record.get(0).is_some_and(|c| c.trim().is_empty()) {
                    continue;
                }
                if record.len() != 4 {
                    metrics::counter!("eav_csv_parse_errors_total").increment(1);
                    yield Err(ParseError::row(format!(
                        "expected 4 columns, found {}",
                        record.len()
                    )));
                    continue;
                }

                let ts = match timestamp::parse_any(&record[0]) {
                    Ok(ts) => ts,
                    Err(e) => {
                        metrics::counter!("eav_csv_parse_errors_total").increment(1);
                        yield Err(ParseError::row(e.to_string()));
                        continue;
                    }
                };
                let logger_id = record[1].trim();
                if logger_id.is_empty() {
                    metrics::counter!("eav_csv_parse_errors_total").increment(1);
                    yield Err(ParseError::row("empty logger id".to_string()));
                    continue;
                }

                let key = (logger_id.to_string(), ts);
                let group = groups.entry(key.clone()).or_insert_with(|| {
                    order.push(key);
                    PivotGroup {
                        measurement: UnifiedMeasurement::new(ts, logger_id, NAME),
                        claimed: [false; 3],
                    }
                });
                group.apply(&record[2], &record[3]);
            }

            if order.is_empty() {
                yield Err(ParseError::file("no valid EAV rows in file"));
                return;
            }

            for key in order {
                if let Some(group) = groups.remove(&key) {
                    yield Ok(group.measurement);
                }
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use time::macros::datetime;

    async fn collect(data: &str) -> Vec<Result<UnifiedMeasurement, ParseError>> {
        EavCsvParser
            .parse("export.csv", data.as_bytes().to_vec())
            .collect()
            .await
    }

    #[tokio::test]
    async fn pivots_one_group_into_one_record() {
        let data = "\
20251001T020435;WR-1;pac;1000
20251001T020435;WR-1;e_day;3.2
20251001T020435;WR-1;irradiance;850
";
        let out = collect(data).await;
        assert_eq!(out.len(), 1);
        let m = out[0].as_ref().unwrap();
        assert_eq!(m.timestamp, datetime!(2025-10-01 02:04:35 UTC));
        assert_eq!(m.logger_id, "WR-1");
        assert_eq!(m.active_power_watts, Some(1000.0));
        assert_eq!(m.energy_daily_kwh, Some(3.2));
        assert_eq!(m.irradiance, Some(850.0));
    }

    #[tokio::test]
    async fn first_golden_mapping_wins() {
        let data = "\
20251001T020435;WR-1;pac;--
20251001T020435;WR-1;power;1500
";
        let out = collect(data).await;
        let m = out[0].as_ref().unwrap();
        // `pac` claimed the slot with a sentinel; `power` must not overwrite.
        assert_eq!(m.active_power_watts, None);
    }

    #[tokio::test]
    async fn unknown_keys_land_in_metadata_normalized() {
        let data = "20251001T020435;WR-1;udc;410.5\n";
        let out = collect(data).await;
        let m = out[0].as_ref().unwrap();
        assert!(m.metadata.contains_key("dcVoltage"));
    }

    #[tokio::test]
    async fn interleaved_loggers_group_separately() {
        let data = "\
20251001T020435;WR-1;pac;1000
20251001T020435;WR-2;pac;2000
20251001T020435;WR-1;e_day;3.2
";
        let out = collect(data).await;
        let records: Vec<_> = out.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].logger_id, "WR-1");
        assert_eq!(records[0].energy_daily_kwh, Some(3.2));
        assert_eq!(records[1].logger_id, "WR-2");
    }

    #[tokio::test]
    async fn bad_timestamps_skip_the_row_only() {
        let data = "\
20251032T120000;WR-1;pac;900
20251001T020435;WR-1;pac;1000
";
        let out = collect(data).await;
        assert!(matches!(out[0], Err(ParseError::Row(_))));
        let m = out[1].as_ref().unwrap();
        assert_eq!(m.active_power_watts, Some(1000.0));
    }

    #[tokio::test]
    async fn all_rows_invalid_is_a_file_error() {
        let data = "not-a-timestamp;WR-1;pac;1000\n";
        let out = collect(data).await;
        assert!(matches!(out.last(), Some(Err(ParseError::File(_)))));
    }

    #[test]
    fn detects_four_column_timestamped_rows() {
        let p = EavCsvParser;
        assert!(p.can_handle("x.csv", b"20251001T020435;WR-1;pac;1000\n"));
        assert!(p.can_handle("x.csv", b"2025-10-01 02:04:35,WR-1,pac,1000\n"));
        assert!(!p.can_handle("x.csv", b"timestamp,serial,pac,etoday,etotal,status\n"));
        assert!(!p.can_handle("x.csv", b"[info]\nAnlage=Test\n"));
    }
}
