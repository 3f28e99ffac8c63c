//! Minimal sectioned CSV export: a `[header]` section carrying `key=value`
//! metadata plus one semicolon-delimited column row, then a `[data]` section
//! of rows zipped against that column row. Parsed by an explicit state
//! machine over lines.

use std::collections::HashMap;

use async_stream::stream;
use pv_client::domain::UnifiedMeasurement;

use crate::parse::fields::{self, GoldenMetric};
use crate::parse::{timestamp, value, FormatParser, MeasurementStream, ParseError};

pub struct SectionCsvParser;

const NAME: &str = "section-csv";
const DELIMITER: char = ';';

#[derive(PartialEq)]
enum State {
    Preamble,
    Header,
    Data,
}

fn is_marker(line: &str, marker: &str) -> bool {
    line.trim().eq_ignore_ascii_case(marker)
}

/// One parsed column: the raw label split into name and declared unit.
struct Column {
    golden: Option<GoldenMetric>,
    metadata_key: String,
    scale: f64,
}

fn plan_columns(header: &[&str]) -> Vec<Column> {
    header
        .iter()
        .map(|label| {
            let (name, unit) = fields::split_column_unit(label);
            Column {
                golden: fields::golden_metric_for(name),
                metadata_key: fields::normalize_key(name),
                scale: fields::power_scale(unit),
            }
        })
        .collect()
}

fn apply_cell(m: &mut UnifiedMeasurement, column: &Column, raw: &str) {
    match column.golden {
        Some(GoldenMetric::ActivePower) => {
            m.active_power_watts = value::parse_metric(raw).map(|v| v * column.scale);
        }
        Some(GoldenMetric::EnergyDaily) => {
            m.energy_daily_kwh = value::parse_metric(raw);
        }
        Some(GoldenMetric::Irradiance) => {
            m.irradiance = value::parse_metric(raw);
        }
        None => {
            m.insert_metadata(column.metadata_key.clone(), value::metadata_value(raw));
        }
    }
}

impl FormatParser for SectionCsvParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Sectioned [header]/[data] CSV with key=value logger metadata"
    }

    fn can_handle(&self, _filename: &str, snippet: &[u8]) -> bool {
        let text = String::from_utf8_lossy(snippet);
        text.lines()
            .find(|l| !l.trim().is_empty())
            .is_some_and(|l| is_marker(l, "[header]"))
    }

    fn parse(&self, _filename: &str, data: Vec<u8>) -> MeasurementStream {
        let s = stream! {
            let text = String::from_utf8_lossy(&data).into_owned();

            let mut state = State::Preamble;
            let mut meta: HashMap<String, String> = HashMap::new();
            let mut columns: Vec<Column> = Vec::new();
            let mut logger_id: Option<String> = None;
            let mut emitted = 0usize;

            for line in text.lines() {
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() {
                    continue;
                }

                if is_marker(line, "[header]") {
                    state = State::Header;
                    continue;
                }
                if is_marker(line, "[data]") {
                    if columns.is_empty() {
                        yield Err(ParseError::file("[data] reached without a column row in [header]"));
                        return;
                    }
                    logger_id = meta
                        .get("logger")
                        .or_else(|| meta.get("serial"))
                        .or_else(|| meta.get("seriennummer"))
                        .cloned();
                    if logger_id.is_none() {
                        yield Err(ParseError::file(
                            "[header] carries no logger/serial identifier",
                        ));
                        return;
                    }
                    state = State::Data;
                    continue;
                }

                match state {
                    State::Preamble => {}
                    State::Header => {
                        if let Some((k, v)) = line.split_once('=') {
                            meta.insert(k.trim().to_lowercase(), v.trim().to_string());
                        } else if line.contains(DELIMITER) {
                            columns = plan_columns(
                                &line.split(DELIMITER).map(str::trim).collect::<Vec<_>>(),
                            );
                        }
                    }
                    State::Data => {
                        let cells: Vec<&str> = line.split(DELIMITER).map(str::trim).collect();
                        if cells.len() != columns.len() {
                            metrics::counter!("section_csv_parse_errors_total").increment(1);
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
                                metrics::counter!("section_csv_parse_errors_total").increment(1);
                                yield Err(ParseError::row(e.to_string()));
                                continue;
                            }
                        };

                        let mut m = UnifiedMeasurement::new(
                            ts,
                            logger_id.as_deref().unwrap_or_default(),
                            NAME,
                        );
                        for (column, cell) in columns.iter().zip(&cells).skip(1) {
                            apply_cell(&mut m, column, cell);
                        }
                        emitted += 1;
                        yield Ok(m);
                    }
                }
            }

            if state != State::Data {
                yield Err(ParseError::file("missing mandatory [data] section"));
                return;
            }
            if emitted == 0 {
                yield Err(ParseError::file("no valid rows in [data] section"));
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

    const SAMPLE: &str = "\
[header]
Logger=WR-0815
Interval=300
Timestamp;Pac;DaySum;Udc;Temp
[data]
2025-10-01 10:00:00;1520;3.2;410.5;41
2025-10-01 10:05:00;--;3.2;409.8;41
";

    async fn collect(data: &str) -> Vec<Result<UnifiedMeasurement, ParseError>> {
        SectionCsvParser
            .parse("export.txt", data.as_bytes().to_vec())
            .collect()
            .await
    }

    #[tokio::test]
    async fn parses_rows_against_header_columns() {
        let out = collect(SAMPLE).await;
        assert_eq!(out.len(), 2);

        let m = out[0].as_ref().unwrap();
        assert_eq!(m.timestamp, datetime!(2025-10-01 10:00:00 UTC));
        assert_eq!(m.logger_id, "WR-0815");
        assert_eq!(m.active_power_watts, Some(1520.0));
        assert_eq!(m.energy_daily_kwh, Some(3.2));
        assert!(m.metadata.contains_key("dcVoltage"));
        assert!(m.metadata.contains_key("temperature"));
    }

    #[tokio::test]
    async fn sentinel_power_is_null() {
        let out = collect(SAMPLE).await;
        let m = out[1].as_ref().unwrap();
        assert_eq!(m.active_power_watts, None);
        assert_eq!(m.energy_daily_kwh, Some(3.2));
    }

    #[tokio::test]
    async fn column_count_mismatch_skips_the_row() {
        let data = "\
[header]
Logger=WR-0815
Timestamp;Pac
[data]
2025-10-01 10:00:00;1520;extra
2025-10-01 10:05:00;1530
";
        let out = collect(data).await;
        assert!(matches!(out[0], Err(ParseError::Row(_))));
        assert!(out[1].is_ok());
    }

    #[tokio::test]
    async fn missing_data_section_is_a_file_error() {
        let data = "[header]\nLogger=WR-0815\nTimestamp;Pac\n";
        let out = collect(data).await;
        assert!(matches!(out.last(), Some(Err(ParseError::File(_)))));
    }

    #[tokio::test]
    async fn missing_logger_identity_is_a_file_error() {
        let data = "[header]\nInterval=300\nTimestamp;Pac\n[data]\n2025-10-01 10:00:00;1\n";
        let out = collect(data).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(ParseError::File(_))));
    }

    #[test]
    fn detects_leading_header_marker() {
        let p = SectionCsvParser;
        assert!(p.can_handle("any.txt", b"[header]\nLogger=X\n"));
        assert!(p.can_handle("any.txt", b"\n  [HEADER]\nLogger=X\n"));
        assert!(!p.can_handle("any.txt", b"[info]\nAnlage=X\n"));
    }
}
