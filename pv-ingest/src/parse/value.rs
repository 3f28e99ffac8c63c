//! Numeric value grammar shared by all format parsers.

use pv_client::domain::MetadataValue;

/// Tokens loggers use for "no reading". Distinct from a real zero.
pub fn is_sentinel(raw: &str) -> bool {
    let t = raw.trim();
    t.is_empty() || t == "-" || t == "--" || t == ": --" || t.eq_ignore_ascii_case("n/a")
}

/// Parses a measured value: sentinels and garbage become `None`, never zero.
/// Accepts decimal commas, strips trailing unit suffixes (`3.2 kWh`, `25°C`,
/// `98 %`) and normalizes negative zero to zero.
pub fn parse_metric(raw: &str) -> Option<f64> {
    let t = raw.trim();
    if is_sentinel(t) {
        return None;
    }

    let numeric = t
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .trim()
        .replace(',', ".");

    match numeric.parse::<f64>() {
        // -0.0 == 0.0, so this arm also normalizes negative zero.
        Ok(v) if v == 0.0 => Some(0.0),
        Ok(v) => Some(v),
        Err(_) => None,
    }
}

/// Classifies a raw metadata cell: sentinel -> `Null`, numeric -> `Number`,
/// anything else is kept as a device state string.
pub fn metadata_value(raw: &str) -> MetadataValue {
    let t = raw.trim();
    if is_sentinel(t) {
        return MetadataValue::Null;
    }
    match parse_metric(t) {
        Some(v) => MetadataValue::Number(v),
        None => MetadataValue::Text(t.to_string()),
    }
}
