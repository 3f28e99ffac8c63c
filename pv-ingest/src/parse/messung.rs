//! Rich sectioned logger export: `[info]` metadata, a `[messung]` section
//! holding interval settings and the column row, and a `[Start]` marker for
//! the data rows. Parsed by an explicit state machine over lines.
//!
//! The header's column set selects one of two sub-schemas: analog sensor
//! boxes (irradiance/temperature columns, one constant logger id taken from
//! `[info]`) and inverter telemetry (per-row serial column, power reported
//! in kW and scaled to W).

use std::collections::HashMap;

use async_stream::stream;
use pv_client::domain::UnifiedMeasurement;

use crate::parse::fields::{self, GoldenMetric};
use crate::parse::{timestamp, value, FormatParser, MeasurementStream, ParseError};

pub struct MessungParser;

const NAME: &str = "messung-ini";
const DELIMITER: char = ';';

enum State {
    Preamble,
    Info,
    Messung,
    Data,
}

enum ColRole {
    Timestamp,
    Serial,
    Golden(GoldenMetric, f64),
    Metadata(String),
}

fn is_marker(line: &str, marker: &str) -> bool {
    line.trim().eq_ignore_ascii_case(marker)
}

fn is_serial_label(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "seriennummer" | "serial" | "sn" | "wr"
    )
}

fn plan_columns(header: &[&str]) -> Vec<ColRole> {
    header
        .iter()
        .enumerate()
        .map(|(i, label)| {
            let (name, unit) = fields::split_column_unit(label);
            if i == 0 {
                ColRole::Timestamp
            } else if is_serial_label(name) {
                ColRole::Serial
            } else if let Some(metric) = fields::golden_metric_for(name) {
                let scale = match metric {
                    GoldenMetric::ActivePower => fields::power_scale(unit),
                    _ => 1.0,
                };
                ColRole::Golden(metric, scale)
            } else {
                ColRole::Metadata(fields::normalize_key(name))
            }
        })
        .collect()
}

/// Captures a `key=value` or `key;value` metadata line, split on the first
/// separator. Returns false for anything else (e.g. a column row).
fn capture_pair(line: &str, into: &mut HashMap<String, String>) -> bool {
    if let Some((k, v)) = line.split_once('=') {
        into.insert(k.trim().to_lowercase(), v.trim().to_string());
        return true;
    }
    let cells: Vec<&str> = line.split(DELIMITER).collect();
    if cells.len() == 2 {
        into.insert(cells[0].trim().to_lowercase(), cells[1].trim().to_string());
        return true;
    }
    false
}

impl FormatParser for MessungParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Sectioned [info]/[messung]/[Start] logger export with sensor and inverter sub-schemas"
    }

    fn can_handle(&self, _filename: &str, snippet: &[u8]) -> bool {
        let text = String::from_utf8_lossy(snippet);
        let first = text.lines().find(|l| !l.trim().is_empty());
        first.is_some_and(|l| is_marker(l, "[info]"))
            || text.lines().any(|l| is_marker(l, "[messung]"))
    }

    fn parse(&self, _filename: &str, data: Vec<u8>) -> MeasurementStream {
        let s = stream! {
            let text = String::from_utf8_lossy(&data).into_owned();

            let mut state = State::Preamble;
            let mut info: HashMap<String, String> = HashMap::new();
            let mut columns: Vec<ColRole> = Vec::new();
            let mut file_logger: Option<String> = None;
            let mut per_row_serial = false;
            let mut emitted = 0usize;

            for line in text.lines() {
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() {
                    continue;
                }

                if is_marker(line, "[info]") {
                    state = State::Info;
                    continue;
                }
                if is_marker(line, "[messung]") {
                    state = State::Messung;
                    continue;
                }
                if is_marker(line, "[start]") {
                    if columns.is_empty() {
                        yield Err(ParseError::file(
                            "[Start] reached without a column row in [messung]",
                        ));
                        return;
                    }
                    per_row_serial = columns.iter().any(|c| matches!(c, ColRole::Serial));
                    if !per_row_serial {
                        file_logger = info
                            .get("seriennummer")
                            .or_else(|| info.get("serial"))
                            .or_else(|| info.get("logger"))
                            .cloned();
                        if file_logger.is_none() {
                            yield Err(ParseError::file(
                                "[info] carries no serial for the analog sensor schema",
                            ));
                            return;
                        }
                    }
                    state = State::Data;
                    continue;
                }

                match state {
                    State::Preamble => {}
                    State::Info => {
                        capture_pair(line, &mut info);
                    }
                    State::Messung => {
                        if !capture_pair(line, &mut info) && line.contains(DELIMITER) {
                            columns = plan_columns(
                                &line.split(DELIMITER).map(str::trim).collect::<Vec<_>>(),
                            );
                        }
                    }
                    State::Data => {
                        let cells: Vec<&str> = line.split(DELIMITER).map(str::trim).collect();
                        if cells.len() != columns.len() {
                            metrics::counter!("messung_parse_errors_total").increment(1);
                            yield Err(ParseError::row(format!(
                                "expected {} columns, found {}",
                                columns.len(),
                                cells.len()
                            )));
                            continue;
                        }

                        let ts = match timestamp::parse_any(cells[0]) {
                            Ok(ts) => ts,
                            Err(e) => {
                                metrics::counter!("messung_parse_errors_total").increment(1);
                                yield Err(ParseError::row(e.to_string()));
                                continue;
                            }
                        };

                        let logger_id = if per_row_serial {
                            let serial = columns
                                .iter()
                                .zip(&cells)
                                .find_map(|(c, cell)| {
                                    matches!(c, ColRole::Serial).then_some(*cell)
                                })
                                .unwrap_or_default();
                            if serial.is_empty() {
                                metrics::counter!("messung_parse_errors_total").increment(1);
                                yield Err(ParseError::row("empty serial column".to_string()));
                                continue;
                            }
                            serial.to_string()
                        } else {
                            file_logger.clone().unwrap_or_default()
                        };

                        let mut m = UnifiedMeasurement::new(ts, logger_id, NAME);
                        for (column, cell) in columns.iter().zip(&cells) {
                            match column {
                                ColRole::Timestamp | ColRole::Serial => {}
                                ColRole::Golden(metric, scale) => {
                                    let parsed = value::parse_metric(cell).map(|v| v * scale);
                                    match metric {
                                        GoldenMetric::ActivePower => m.active_power_watts = parsed,
                                        GoldenMetric::EnergyDaily => m.energy_daily_kwh = parsed,
                                        GoldenMetric::Irradiance => m.irradiance = parsed,
                                    }
                                }
                                ColRole::Metadata(key) => {
                                    m.insert_metadata(key.clone(), value::metadata_value(cell));
                                }
                            }
                        }
                        emitted += 1;
                        yield Ok(m);
                    }
                }
            }

            if !matches!(state, State::Data) {
                yield Err(ParseError::file("missing mandatory [Start] section"));
                return;
            }
            if emitted == 0 {
                yield Err(ParseError::file("no valid rows after [Start]"));
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
    use time::macros::datetime;

    async fn collect(data: &str) -> Vec<Result<UnifiedMeasurement, ParseError>> {
        MessungParser
            .parse("messung.txt", data.as_bytes().to_vec())
            .collect()
            .await
    }

    #[tokio::test]
    async fn inverter_schema_scales_kilowatts_and_reads_per_row_serial() {
        let data = "\
[info]
Anlage=Muster Sued
Typ=WR17
[messung]
Intervall=60
Datum_Zeit;Seriennummer;Pac[kW];Udc;Temp
[Start]
2025-10-01 10:00:00;WR17-004211;1,52;410,5;41
2025-10-01 10:00:00;WR17-004212;0,98;408,9;39
";
        let out = collect(data).await;
        assert_eq!(out.len(), 2);

        let m = out[0].as_ref().unwrap();
        assert_eq!(m.timestamp, datetime!(2025-10-01 10:00:00 UTC));
        assert_eq!(m.logger_id, "WR17-004211");
        assert_eq!(m.active_power_watts, Some(1520.0));
        assert_eq!(m.metadata.get("dcVoltage"), Some(&MetadataValue::Number(410.5)));

        let m2 = out[1].as_ref().unwrap();
        assert_eq!(m2.logger_id, "WR17-004212");
        assert_eq!(m2.active_power_watts, Some(980.0));
    }

    #[tokio::test]
    async fn analog_schema_uses_constant_logger_and_irradiance() {
        let data = "\
[info]
Anlage=Muster Sued
Seriennummer;SB-771
[messung]
Intervall=300
Datum_Zeit;Einstrahlung[W/m2];Temperatur;Windgeschwindigkeit
[Start]
2025-10-01 10:00:00;850;21,5;3,2
";
        let out = collect(data).await;
        let m = out[0].as_ref().unwrap();
        assert_eq!(m.logger_id, "SB-771");
        assert_eq!(m.irradiance, Some(850.0));
        assert_eq!(m.active_power_watts, None);
        assert_eq!(m.metadata.get("temperature"), Some(&MetadataValue::Number(21.5)));
        assert_eq!(m.metadata.get("windSpeed"), Some(&MetadataValue::Number(3.2)));
    }

    #[tokio::test]
    async fn analog_schema_without_info_serial_is_a_file_error() {
        let data = "\
[info]
Anlage=Muster
[messung]
Datum_Zeit;Einstrahlung[W/m2];Temperatur
[Start]
2025-10-01 10:00:00;850;21,5
";
        let out = collect(data).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(ParseError::File(_))));
    }

    #[tokio::test]
    async fn missing_start_marker_is_a_file_error() {
        let data = "[info]\nAnlage=X\n[messung]\nDatum_Zeit;Seriennummer;Pac[kW]\n";
        let out = collect(data).await;
        assert!(matches!(out.last(), Some(Err(ParseError::File(_)))));
    }

    #[test]
    fn detects_info_or_messung_markers() {
        let p = MessungParser;
        assert!(p.can_handle("x.txt", b"[info]\nAnlage=X\n"));
        assert!(p.can_handle("x.txt", b"preamble\n[messung]\n"));
        assert!(!p.can_handle("x.txt", b"[header]\nLogger=X\n"));
    }
}
