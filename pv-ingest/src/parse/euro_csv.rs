//! Fixed-schema semicolon CSV with separate `Datum`/`Zeit` columns: day-first
//! dotted dates, decimal commas, and the end-of-day convention where midnight
//! is written as `24:00:00` on the closing day.

use async_stream::stream;
use pv_client::domain::UnifiedMeasurement;

use crate::parse::fields::{self, GoldenMetric};
use crate::parse::{timestamp, value, FormatParser, MeasurementStream, ParseError};

pub struct EuroCsvParser;

const NAME: &str = "euro-csv";

enum ColRole {
    Date,
    Time,
    Serial,
    Golden(GoldenMetric, f64),
    Metadata(String),
}

fn is_serial_label(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "wr" | "seriennummer" | "serial" | "sn" | "logger"
    )
}

fn plan_columns(header: &[&str]) -> Vec<ColRole> {
    header
        .iter()
        .map(|label| {
            let (name, unit) = fields::split_column_unit(label);
            let lower = name.to_lowercase();
            if lower == "datum" {
                ColRole::Date
            } else if lower == "zeit" {
                ColRole::Time
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

impl FormatParser for EuroCsvParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Semicolon CSV with separate day-first Datum/Zeit columns and decimal commas"
    }

    fn can_handle(&self, _filename: &str, snippet: &[u8]) -> bool {
        let text = String::from_utf8_lossy(snippet);
        text.lines()
            .find(|l| !l.trim().is_empty())
            .is_some_and(|l| l.to_lowercase().starts_with("datum;zeit"))
    }

    fn parse(&self, _filename: &str, data: Vec<u8>) -> MeasurementStream {
        let s = stream! {
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
            let columns = plan_columns(&headers.iter().collect::<Vec<_>>());
            let has_serial = columns.iter().any(|c| matches!(c, ColRole::Serial));
            if !has_serial {
                yield Err(ParseError::file("header carries no serial/WR column"));
                return;
            }

            let mut emitted = 0usize;
            for result in rdr.records() {
                let record = match result {
                    Ok(r) => r,
                    Err(e) => {
                        metrics::counter!("euro_csv_parse_errors_total").increment(1);
                        yield Err(ParseError::row(format!("unreadable row: {e}")));
                        continue;
                    }
                };
                if record.len() != columns.len() {
                    metrics::counter!("euro_csv_parse_errors_total").increment(1);
                    yield Err(ParseError::row(format!(
                        "expected {} columns, found {}",
                        columns.len(),
                        record.len()
                    )));
                    continue;
                }

                let mut date = "";
                let mut time = "";
                let mut serial = "";
                for (role, cell) in columns.iter().zip(record.iter()) {
                    match role {
                        ColRole::Date => date = cell,
                        ColRole::Time => time = cell,
                        ColRole::Serial => serial = cell,
                        _ => {}
                    }
                }

                let ts = match timestamp::combine_date_time(date, time) {
                    Ok(ts) => ts,
                    Err(e) => {
                        metrics::counter!("euro_csv_parse_errors_total").increment(1);
                        yield Err(ParseError::row(e.to_string()));
                        continue;
                    }
                };
                if serial.is_empty() {
                    metrics::counter!("euro_csv_parse_errors_total").increment(1);
                    yield Err(ParseError::row("empty serial column".to_string()));
                    continue;
                }

                let mut m = UnifiedMeasurement::new(ts, serial, NAME);
                for (role, cell) in columns.iter().zip(record.iter()) {
                    match role {
                        ColRole::Date | ColRole::Time | ColRole::Serial => {}
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
        EuroCsvParser
            .parse("tagesdaten.csv", data.as_bytes().to_vec())
            .collect()
            .await
    }

    #[tokio::test]
    async fn day_first_dates_and_decimal_commas_parse() {
        let data = "\
Datum;Zeit;WR;Pac;Tagesenergie;Einstrahlung
01.10.2025;01:50:00;WR-5;1520;3,2;850
";
        let out = collect(data).await;
        let m = out[0].as_ref().unwrap();
        // October 1st, never January 10th.
        assert_eq!(m.timestamp, datetime!(2025-10-01 01:50:00 UTC));
        assert_eq!(m.logger_id, "WR-5");
        assert_eq!(m.energy_daily_kwh, Some(3.2));
        assert_eq!(m.irradiance, Some(850.0));
    }

    #[tokio::test]
    async fn midnight_24_rolls_to_the_next_day() {
        let data = "\
Datum;Zeit;WR;Pac
01.10.2025;24:00:00;WR-5;0
";
        let out = collect(data).await;
        let m = out[0].as_ref().unwrap();
        assert_eq!(m.timestamp, datetime!(2025-10-02 00:00:00 UTC));
        assert_eq!(m.active_power_watts, Some(0.0));
    }

    #[tokio::test]
    async fn kilowatt_power_columns_scale_to_watts() {
        let data = "\
Datum;Zeit;WR;Pac[kW]
01.10.2025;10:00:00;WR-5;1,52
";
        let out = collect(data).await;
        let m = out[0].as_ref().unwrap();
        assert_eq!(m.active_power_watts, Some(1520.0));
    }

    #[tokio::test]
    async fn missing_serial_column_is_a_file_error() {
        let data = "Datum;Zeit;Pac\n01.10.2025;10:00:00;1520\n";
        let out = collect(data).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(ParseError::File(_))));
    }

    #[test]
    fn detects_datum_zeit_header() {
        let p = EuroCsvParser;
        assert!(p.can_handle("x.csv", b"Datum;Zeit;WR;Pac\n"));
        assert!(!p.can_handle("x.csv", b"timestamp,serial,pac\n"));
    }
}
