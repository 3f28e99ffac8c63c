//! Fixed-schema CSV with Unix-epoch timestamps. Epochs are guarded against
//! logger clock garbage: anything outside the years 2000-2100 skips the row.

use async_stream::stream;
use pv_client::domain::UnifiedMeasurement;

use crate::parse::fields::{self, GoldenMetric};
use crate::parse::{timestamp, value, FormatParser, MeasurementStream, ParseError};

pub struct EpochCsvParser;

const NAME: &str = "epoch-csv";

enum ColRole {
    Timestamp,
    Serial,
    Golden(GoldenMetric),
    Metadata(String),
}

fn plan_columns(headers: &csv::StringRecord) -> (Vec<ColRole>, bool) {
    let mut saw_required = (false, false);
    let roles = headers
        .iter()
        .map(|h| {
            let name = h.trim();
            if name.eq_ignore_ascii_case("timestamp") {
                saw_required.0 = true;
                ColRole::Timestamp
            } else if name.eq_ignore_ascii_case("serial") {
                saw_required.1 = true;
                ColRole::Serial
            } else if let Some(metric) = fields::golden_metric_for(name) {
                ColRole::Golden(metric)
            } else {
                ColRole::Metadata(fields::normalize_key(name))
            }
        })
        .collect();
    (roles, saw_required.0 && saw_required.1)
}

impl FormatParser for EpochCsvParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Fixed-schema CSV keyed by Unix-epoch timestamp and serial columns"
    }

    fn can_handle(&self, _filename: &str, snippet: &[u8]) -> bool {
        let text = String::from_utf8_lossy(snippet);
        let Some(header) = text.lines().find(|l| !l.trim().is_empty()) else {
            return false;
        };
        let header = header.to_lowercase();
        header.starts_with("timestamp,") && header.split(',').any(|c| c.trim() == "serial")
    }

    fn parse(&self, _filename: &str, data: Vec<u8>) -> MeasurementStream {
        let s = stream! {
            let mut rdr = csv::ReaderBuilder::new()
                .trim(csv::Trim::All)
                .flexible(true)
                .from_reader(data.as_slice());

            let headers = match rdr.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    yield Err(ParseError::file(format!("failed to read CSV headers: {e}")));
                    return;
                }
            };
            let (columns, complete) = plan_columns(&headers);
            if !complete {
                yield Err(ParseError::file(
                    "header is missing the timestamp/serial columns",
                ));
                return;
            }

            let mut emitted = 0usize;
            for result in rdr.records() {
                let record = match result {
                    Ok(r) => r,
                    Err(e) => {
                        metrics::counter!("epoch_csv_parse_errors_total").increment(1);
                        yield Err(ParseError::row(format!("unreadable CSV row: {e}")));
                        continue;
                    }
                };
                if record.len() != columns.len() {
                    metrics::counter!("epoch_csv_parse_errors_total").increment(1);
                    yield Err(ParseError::row(format!(
                        "expected {} columns, found {}",
                        columns.len(),
                        record.len()
                    )));
                    continue;
                }

                let mut epoch: Option<&str> = None;
                let mut serial: Option<&str> = None;
                for (role, cell) in columns.iter().zip(record.iter()) {
                    match role {
                        ColRole::Timestamp => epoch = Some(cell),
                        ColRole::Serial => serial = Some(cell),
                        _ => {}
                    }
                }

                let ts = match epoch.unwrap_or_default().parse::<i64>() {
                    Ok(secs) => match timestamp::parse_epoch_guarded(secs) {
                        Ok(ts) => ts,
                        Err(e) => {
                            metrics::counter!("epoch_csv_parse_errors_total").increment(1);
                            yield Err(ParseError::row(e.to_string()));
                            continue;
                        }
                    },
                    Err(_) => {
                        metrics::counter!("epoch_csv_parse_errors_total").increment(1);
                        yield Err(ParseError::row(format!(
                            "non-numeric epoch '{}'",
                            epoch.unwrap_or_default()
                        )));
                        continue;
                    }
                };

                let serial = serial.unwrap_or_default();
                if serial.is_empty() {
                    metrics::counter!("epoch_csv_parse_errors_total").increment(1);
                    yield Err(ParseError::row("empty serial column".to_string()));
                    continue;
                }

                let mut m = UnifiedMeasurement::new(ts, serial, NAME);
                for (role, cell) in columns.iter().zip(record.iter()) {
                    match role {
                        ColRole::Timestamp | ColRole::Serial => {}
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
                yield Err(ParseError::file("no valid rows in CSV"));
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
        EpochCsvParser
            .parse("minutes.csv", data.as_bytes().to_vec())
            .collect()
            .await
    }

    #[tokio::test]
    async fn parses_epoch_rows() {
        let data = "\
timestamp,serial,pac,e_day,e_total,status
946684800,WR-9,1520,3.2,10452.7,OK
";
        let out = collect(data).await;
        let m = out[0].as_ref().unwrap();
        assert_eq!(m.timestamp, datetime!(2000-01-01 00:00:00 UTC));
        assert_eq!(m.logger_id, "WR-9");
        assert_eq!(m.active_power_watts, Some(1520.0));
        assert_eq!(m.energy_daily_kwh, Some(3.2));
        assert!(m.metadata.contains_key("energyTotalKwh"));
    }

    #[tokio::test]
    async fn epoch_outside_window_skips_the_row() {
        let data = "\
timestamp,serial,pac
946684799,WR-9,100
4102444801,WR-9,200
4102444800,WR-9,300
";
        let out = collect(data).await;
        assert!(matches!(out[0], Err(ParseError::Row(_))));
        assert!(matches!(out[1], Err(ParseError::Row(_))));
        let m = out[2].as_ref().unwrap();
        assert_eq!(m.timestamp, datetime!(2100-01-01 00:00:00 UTC));
    }

    #[tokio::test]
    async fn sentinel_golden_cells_are_null() {
        let data = "timestamp,serial,pac\n946684800,WR-9,--\n";
        let out = collect(data).await;
        let m = out[0].as_ref().unwrap();
        assert_eq!(m.active_power_watts, None);
    }

    #[tokio::test]
    async fn missing_required_columns_is_a_file_error() {
        let data = "timestamp,pac\n946684800,100\n";
        let out = collect(data).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(ParseError::File(_))));
    }

    #[test]
    fn detects_epoch_header() {
        let p = EpochCsvParser;
        assert!(p.can_handle("x.csv", b"timestamp,serial,pac,e_day\n946684800,WR-9,1,2\n"));
        assert!(!p.can_handle("x.csv", b"Datum;Zeit;WR;Pac\n"));
    }
}
