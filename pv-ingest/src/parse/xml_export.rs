//! Hierarchical XML export: the document is parsed into a small element
//! tree, then walked along the fixed path
//! root -> `system` -> `measurement-data` -> `datapoint[]` -> `inverter[]`
//! -> `value[]`, emitting one record per (datapoint, inverter) pair.
//!
//! Value cells carry the export's sentinel convention: `": --"` means no
//! reading, and a leading `": "` prefix marks a string state value.

use std::collections::HashMap;

use async_stream::stream;
use pv_client::domain::{MetadataValue, UnifiedMeasurement};
use quick_xml::events::{BytesStart, Event};

use crate::parse::fields::{self, GoldenMetric};
use crate::parse::{timestamp, value, FormatParser, MeasurementStream, ParseError};

pub struct XmlExportParser;

const NAME: &str = "xml-export";

struct Element {
    name: String,
    attrs: HashMap<String, String>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

fn element_from(e: &BytesStart) -> Element {
    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
    let mut attrs = HashMap::new();
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let val = String::from_utf8_lossy(&attr.value).to_string();
        attrs.insert(key, val);
    }
    Element {
        name,
        attrs,
        children: Vec::new(),
        text: String::new(),
    }
}

fn attach(el: Element, stack: &mut Vec<Element>, root: &mut Option<Element>) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(el),
        None => *root = Some(el),
    }
}

fn build_tree(data: &[u8]) -> Result<Element, ParseError> {
    let mut reader = quick_xml::Reader::from_reader(data);
    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => stack.push(element_from(&e)),
            Ok(Event::Empty(e)) => {
                let el = element_from(&e);
                attach(el, &mut stack, &mut root);
            }
            Ok(Event::End(_)) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| ParseError::file("unbalanced XML end tag"))?;
                attach(el, &mut stack, &mut root);
            }
            Ok(Event::Text(t)) => {
                if let Some(top) = stack.last_mut() {
                    if let Ok(s) = t.unescape() {
                        top.text.push_str(s.trim());
                    }
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(top) = stack.last_mut() {
                    top.text
                        .push_str(String::from_utf8_lossy(&t.into_inner()).trim());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ParseError::file(format!("malformed XML: {e}"))),
        }
        buf.clear();
    }

    root.ok_or_else(|| ParseError::file("empty XML document"))
}

/// Decodes one `<value>` cell. `": --"` is the export's "no reading" marker;
/// `": <state>"` carries a device state string; everything else is numeric.
fn decode_cell(raw: &str) -> MetadataValue {
    let t = raw.trim();
    if t == ": --" {
        return MetadataValue::Null;
    }
    if let Some(state) = t.strip_prefix(": ") {
        return MetadataValue::Text(state.trim().to_string());
    }
    value::metadata_value(t)
}

fn as_number(v: &MetadataValue) -> Option<f64> {
    match v {
        MetadataValue::Number(n) => Some(*n),
        _ => None,
    }
}

impl FormatParser for XmlExportParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Hierarchical XML export with per-datapoint inverter value lists"
    }

    fn can_handle(&self, _filename: &str, snippet: &[u8]) -> bool {
        let text = String::from_utf8_lossy(snippet);
        let head = text.trim_start();
        head.starts_with("<?xml") || head.starts_with("<export")
    }

    fn parse(&self, _filename: &str, data: Vec<u8>) -> MeasurementStream {
        let s = stream! {
            let tree = match build_tree(&data) {
                Ok(t) => t,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut saw_measurement_data = false;
            let mut emitted = 0usize;

            for system in tree.children_named("system") {
                let Some(md) = system.child("measurement-data") else {
                    continue;
                };
                saw_measurement_data = true;

                for datapoint in md.children_named("datapoint") {
                    let ts = match datapoint.attr("timestamp") {
                        Some(raw) => match timestamp::parse_any(raw) {
                            Ok(ts) => ts,
                            Err(e) => {
                                metrics::counter!("xml_export_parse_errors_total").increment(1);
                                yield Err(ParseError::row(e.to_string()));
                                continue;
                            }
                        },
                        None => {
                            metrics::counter!("xml_export_parse_errors_total").increment(1);
                            yield Err(ParseError::row("datapoint without timestamp".to_string()));
                            continue;
                        }
                    };

                    for inverter in datapoint.children_named("inverter") {
                        let Some(serial) = inverter.attr("serial").or_else(|| inverter.attr("id"))
                        else {
                            metrics::counter!("xml_export_parse_errors_total").increment(1);
                            yield Err(ParseError::row("inverter without serial".to_string()));
                            continue;
                        };

                        let mut m = UnifiedMeasurement::new(ts, serial, NAME);
                        for val in inverter.children_named("value") {
                            let Some(name) = val.attr("name") else {
                                continue;
                            };
                            let cell = decode_cell(&val.text);
                            match fields::golden_metric_for(name) {
                                Some(GoldenMetric::ActivePower) => {
                                    m.active_power_watts = as_number(&cell);
                                }
                                Some(GoldenMetric::EnergyDaily) => {
                                    m.energy_daily_kwh = as_number(&cell);
                                }
                                Some(GoldenMetric::Irradiance) => {
                                    m.irradiance = as_number(&cell);
                                }
                                None => {
                                    m.insert_metadata(fields::normalize_key(name), cell);
                                }
                            }
                        }

                        // Derived series, not part of the export: per-phase
                        // generator power from phase voltage and current.
                        for phase in 1..=3u8 {
                            let volts = m
                                .metadata
                                .get(&format!("acVoltage{phase}"))
                                .and_then(as_number);
                            let amps = m
                                .metadata
                                .get(&format!("acCurrent{phase}"))
                                .and_then(as_number);
                            if let (Some(v), Some(i)) = (volts, amps) {
                                m.insert_metadata(format!("generatorPower{phase}"), v * i);
                            }
                        }

                        emitted += 1;
                        yield Ok(m);
                    }
                }
            }

            if !saw_measurement_data {
                yield Err(ParseError::file("missing <measurement-data> section"));
                return;
            }
            if emitted == 0 {
                yield Err(ParseError::file("no inverter records in XML export"));
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

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<export>
  <system serial="SYS-1">
    <measurement-data>
      <datapoint timestamp="2025-10-01T10:00:00">
        <inverter serial="WR-1">
          <value name="pac">1520</value>
          <value name="e_day">: --</value>
          <value name="uac1">231.4</value>
          <value name="iac1">6.5</value>
          <value name="state">: MPP</value>
        </inverter>
        <inverter serial="WR-2">
          <value name="pac">0</value>
        </inverter>
      </datapoint>
    </measurement-data>
  </system>
</export>
"#;

    async fn collect(data: &str) -> Vec<Result<UnifiedMeasurement, ParseError>> {
        XmlExportParser
            .parse("export.xml", data.as_bytes().to_vec())
            .collect()
            .await
    }

    #[tokio::test]
    async fn emits_one_record_per_datapoint_inverter_pair() {
        let out = collect(SAMPLE).await;
        assert_eq!(out.len(), 2);

        let m = out[0].as_ref().unwrap();
        assert_eq!(m.timestamp, datetime!(2025-10-01 10:00:00 UTC));
        assert_eq!(m.logger_id, "WR-1");
        assert_eq!(m.active_power_watts, Some(1520.0));

        let m2 = out[1].as_ref().unwrap();
        assert_eq!(m2.logger_id, "WR-2");
        // Literal zero stays a real zero.
        assert_eq!(m2.active_power_watts, Some(0.0));
    }

    #[tokio::test]
    async fn sentinel_and_state_values_decode() {
        let out = collect(SAMPLE).await;
        let m = out[0].as_ref().unwrap();
        assert_eq!(m.energy_daily_kwh, None);
        assert_eq!(
            m.metadata.get("status"),
            Some(&MetadataValue::Text("MPP".to_string()))
        );
    }

    #[tokio::test]
    async fn phase_generator_power_is_derived() {
        let out = collect(SAMPLE).await;
        let m = out[0].as_ref().unwrap();
        let p = m.metadata.get("generatorPower1").and_then(as_number).unwrap();
        assert!((p - 231.4 * 6.5).abs() < 1e-9);
        assert!(!m.metadata.contains_key("generatorPower2"));
    }

    #[tokio::test]
    async fn missing_measurement_data_is_a_file_error() {
        let out = collect(r#"<export><system serial="S"/></export>"#).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(ParseError::File(_))));
    }

    #[tokio::test]
    async fn truncated_xml_is_a_file_error() {
        let out = collect("<export><system><measurement-data>").await;
        assert!(matches!(out.last(), Some(Err(ParseError::File(_)))));
    }

    #[test]
    fn detects_xml_preamble() {
        let p = XmlExportParser;
        assert!(p.can_handle("x.xml", b"<?xml version=\"1.0\"?><export/>"));
        assert!(p.can_handle("x.xml", b"<export><system/></export>"));
        assert!(!p.can_handle("x.xml", b"[header]\n"));
    }
}
