//! Per-string monitor export. The logger identity is not in the file at all:
//! it is encoded in the filename as bus/address/string tokens
//! (`B0_A1_S1_global_2025-10-01.txt`), so detection and identity both hang
//! off that compound token. Timestamps use underscore-separated dates.

use async_stream::stream;
use once_cell::sync::Lazy;
use pv_client::domain::UnifiedMeasurement;
use regex::Regex;

use crate::parse::fields::{self, GoldenMetric};
use crate::parse::{base_name, timestamp, value, FormatParser, MeasurementStream, ParseError};

pub struct StringGlobalParser;

const NAME: &str = "string-global";

static FILENAME_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)b(\d+)_a(\d+)_s(\d+)_global_.+\.txt$").unwrap());

fn logger_from_filename(filename: &str) -> Option<String> {
    let caps = FILENAME_TOKEN.captures(base_name(filename))?;
    Some(format!("B{}-A{}-S{}", &caps[1], &caps[2], &caps[3]))
}

enum ColRole {
    Timestamp,
    Golden(GoldenMetric),
    Metadata(String),
}

impl FormatParser for StringGlobalParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Per-string monitor export identified by B{bus}_A{address}_S{string} filename tokens"
    }

    fn can_handle(&self, filename: &str, _snippet: &[u8]) -> bool {
        FILENAME_TOKEN.is_match(base_name(filename))
    }

    fn parse(&self, filename: &str, data: Vec<u8>) -> MeasurementStream {
        let logger_id = logger_from_filename(filename);
        let s = stream! {
            let Some(logger_id) = logger_id else {
                yield Err(ParseError::file(
                    "filename carries no B{bus}_A{address}_S{string} token",
                ));
                return;
            };

            let mut rdr = csv::ReaderBuilder::new()
                .delimiter(b';')
                .trim(csv::Trim::All)
                .flexible(true)
                .from_reader(data.as_slice());

            let headers = match rdr.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    yield Err(ParseError::file(format!("failed to read headers: {e}")));
                    return;
                }
            };
            let columns: Vec<ColRole> = headers
                .iter()
                .enumerate()
                .map(|(i, label)| {
                    let (name, _unit) = fields::split_column_unit(label);
                    if i == 0 {
                        ColRole::Timestamp
                    } else if let Some(metric) = fields::golden_metric_for(name) {
                        ColRole::Golden(metric)
                    } else {
                        ColRole::Metadata(fields::normalize_key(name))
                    }
                })
                .collect();

            let mut emitted = 0usize;
            for result in rdr.records() {
                let record = match result {
                    Ok(r) => r,
                    Err(e) => {
                        metrics::counter!("string_global_parse_errors_total").increment(1);
                        yield Err(ParseError::row(format!("unreadable row: {e}")));
                        continue;
                    }
                };
                if record.len() != columns.len() {
                    metrics::counter!("string_global_parse_errors_total").increment(1);
                    yield Err(ParseError::row(format!(
                        "expected {} columns, found {}",
                        columns.len(),
                        record.len()
                    )));
                    continue;
                }

                let ts = match timestamp::parse_any(&record[0]) {
                    Ok(ts) => ts,
                    Err(e) => {
                        metrics::counter!("string_global_parse_errors_total").increment(1);
                        yield Err(ParseError::row(e.to_string()));
                        continue;
                    }
                };

                let mut m = UnifiedMeasurement::new(ts, logger_id.clone(), NAME);
                for (role, cell) in columns.iter().zip(record.iter()) {
                    match role {
                        ColRole::Timestamp => {}
                        ColRole::Golden(metric) => {
                            let parsed = value::parse_metric(cell);
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

            if emitted == 0 {
                yield Err(ParseError::file("no valid rows in string export"));
            }
        };

        Box::pin(s)
    }
}
