//! Field-name normalization: every raw vendor key is mapped to one canonical
//! camelCase vocabulary before it reaches the metadata map.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// The three typed columns of the canonical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoldenMetric {
    ActivePower,
    EnergyDaily,
    Irradiance,
}

/// Raw keys (lowercased) that map onto a golden-metric slot instead of the
/// metadata map. Includes the canonical slot names themselves so a vendor
/// export that already uses them cannot leak into metadata.
static GOLDEN_KEYS: Lazy<HashMap<&'static str, GoldenMetric>> = Lazy::new(|| {
    use GoldenMetric::*;
    HashMap::from([
        ("pac", ActivePower),
        ("p_ac", ActivePower),
        ("power", ActivePower),
        ("ac_power", ActivePower),
        ("acpower", ActivePower),
        ("leistung", ActivePower),
        ("activepowerwatts", ActivePower),
        ("active_power_watts", ActivePower),
        ("e_day", EnergyDaily),
        ("eday", EnergyDaily),
        ("e_today", EnergyDaily),
        ("etoday", EnergyDaily),
        ("e_tag", EnergyDaily),
        ("daysum", EnergyDaily),
        ("day_energy", EnergyDaily),
        ("daily_yield", EnergyDaily),
        ("tagesenergie", EnergyDaily),
        ("energydailykwh", EnergyDaily),
        ("energy_daily_kwh", EnergyDaily),
        ("irradiance", Irradiance),
        ("irr", Irradiance),
        ("insolation", Irradiance),
        ("einstrahlung", Irradiance),
        ("solar_irradiance", Irradiance),
        ("solarrad", Irradiance),
    ])
});

/// Known raw metadata keys (lowercased): abbreviations and the German terms
/// the European logger formats use.
static KNOWN_KEYS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("udc", "dcVoltage"),
        ("uac", "acVoltage"),
        ("idc", "dcCurrent"),
        ("iac", "acCurrent"),
        ("uzk", "dcLinkVoltage"),
        ("fac", "gridFrequency"),
        ("freq", "gridFrequency"),
        ("frequenz", "gridFrequency"),
        ("netzspannung", "gridVoltage"),
        ("temp", "temperature"),
        ("temperatur", "temperature"),
        ("tkk", "heatsinkTemperature"),
        ("tmodul", "moduleTemperature"),
        ("modultemperatur", "moduleTemperature"),
        ("e_total", "energyTotalKwh"),
        ("etotal", "energyTotalKwh"),
        ("e_gesamt", "energyTotalKwh"),
        ("cos_phi", "powerFactor"),
        ("cosphi", "powerFactor"),
        ("status", "status"),
        ("state", "status"),
        ("err", "errorCode"),
        ("error", "errorCode"),
        ("fehler", "errorCode"),
        ("sn", "serialNumber"),
        ("seriennummer", "serialNumber"),
        ("wind", "windSpeed"),
        ("windgeschwindigkeit", "windSpeed"),
    ])
});

/// Numbered series: `p01` -> `dcPower1`, `u02` -> `dcVoltage2`, etc.
static NUMBERED_SHORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([puit])(\d{1,2})$").unwrap());

/// Numbered AC/DC phase series: `uac1` -> `acVoltage1`, `idc2` -> `dcCurrent2`.
static NUMBERED_PHASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(uac|iac|udc|idc)(\d{1,2})$").unwrap());

/// Returns the golden-metric slot a raw key belongs to, if any. Parsers
/// consult this before `normalize_key` so golden values never end up in the
/// metadata map.
pub fn golden_metric_for(raw: &str) -> Option<GoldenMetric> {
    GOLDEN_KEYS.get(raw.trim().to_lowercase().as_str()).copied()
}

/// Maps a raw vendor key to the canonical camelCase vocabulary: known-key
/// table first, then numbered-series expansion, then a generic camelCase
/// conversion. Raw keys never pass through unchanged.
pub fn normalize_key(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();

    if let Some(canonical) = KNOWN_KEYS.get(lower.as_str()) {
        return (*canonical).to_string();
    }

    if let Some(caps) = NUMBERED_PHASE.captures(&lower) {
        let series = match &caps[1] {
            "uac" => "acVoltage",
            "iac" => "acCurrent",
            "udc" => "dcVoltage",
            _ => "dcCurrent",
        };
        let idx: u32 = caps[2].parse().unwrap_or(0);
        return format!("{series}{idx}");
    }

    if let Some(caps) = NUMBERED_SHORT.captures(&lower) {
        let series = match &caps[1] {
            "p" => "dcPower",
            "u" => "dcVoltage",
            "i" => "dcCurrent",
            _ => "temperature",
        };
        let idx: u32 = caps[2].parse().unwrap_or(0);
        return format!("{series}{idx}");
    }

    camel_case(raw.trim())
}

/// Generic camelCase fallback: split on separators, lower-case the first
/// token, title-case the rest. A single token keeps its inner casing and
/// only has its first letter lowered.
fn camel_case(raw: &str) -> String {
    let tokens: Vec<&str> = raw
        .split(['_', '-', ' ', '.', '/'])
        .filter(|t| !t.is_empty())
        .collect();

    match tokens.len() {
        0 => String::new(),
        1 => {
            let mut chars = tokens[0].chars();
            match chars.next() {
                Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        }
        _ => {
            let mut out = tokens[0].to_lowercase();
            for token in &tokens[1..] {
                let mut chars = token.chars();
                if let Some(first) = chars.next() {
                    out.extend(first.to_uppercase());
                    out.push_str(&chars.as_str().to_lowercase());
                }
            }
            out
        }
    }
}

/// Splits a column label like `Pac[kW]` or `Einstrahlung [W/m2]` into the
/// bare name and its declared unit.
pub fn split_column_unit(label: &str) -> (&str, Option<&str>) {
    let label = label.trim();
    if let Some(open) = label.find('[') {
        if let Some(close) = label.rfind(']') {
            if close > open {
                return (label[..open].trim(), Some(label[open + 1..close].trim()));
            }
        }
    }
    (label, None)
}

/// Scale factor to watts for a declared power unit.
pub fn power_scale(unit: Option<&str>) -> f64 {
    match unit {
        Some(u) if u.eq_ignore_ascii_case("kw") => 1000.0,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn golden_keys_map_to_slots() {
        assert_eq!(golden_metric_for("pac"), Some(GoldenMetric::ActivePower));
        assert_eq!(golden_metric_for("Leistung"), Some(GoldenMetric::ActivePower));
        assert_eq!(golden_metric_for("e_day"), Some(GoldenMetric::EnergyDaily));
        assert_eq!(golden_metric_for("daysum"), Some(GoldenMetric::EnergyDaily));
        assert_eq!(golden_metric_for("Einstrahlung"), Some(GoldenMetric::Irradiance));
        assert_eq!(golden_metric_for("udc"), None);
    }

    #[test]
    fn canonical_slot_names_count_as_golden() {
        // Keeps a vendor's own "activePowerWatts" column out of metadata.
        assert_eq!(
            golden_metric_for("activePowerWatts"),
            Some(GoldenMetric::ActivePower)
        );
    }

    #[test]
    fn known_keys_use_the_table() {
        assert_eq!(normalize_key("Udc"), "dcVoltage");
        assert_eq!(normalize_key("TEMPERATUR"), "temperature");
        assert_eq!(normalize_key("e_total"), "energyTotalKwh");
        assert_eq!(normalize_key("Windgeschwindigkeit"), "windSpeed");
    }

    #[test]
    fn numbered_series_expand() {
        assert_eq!(normalize_key("p01"), "dcPower1");
        assert_eq!(normalize_key("u02"), "dcVoltage2");
        assert_eq!(normalize_key("i12"), "dcCurrent12");
        assert_eq!(normalize_key("t01"), "temperature1");
        assert_eq!(normalize_key("uac1"), "acVoltage1");
        assert_eq!(normalize_key("iac3"), "acCurrent3");
    }

    #[test]
    fn unknown_keys_fall_back_to_camel_case() {
        assert_eq!(normalize_key("ambient_temp_max"), "ambientTempMax");
        assert_eq!(normalize_key("Grid Export Total"), "gridExportTotal");
        assert_eq!(normalize_key("WindSpeed"), "windSpeed");
        assert_eq!(normalize_key("fan.rpm"), "fanRpm");
    }

    #[test]
    fn column_units_split() {
        assert_eq!(split_column_unit("Pac[kW]"), ("Pac", Some("kW")));
        assert_eq!(split_column_unit("Einstrahlung [W/m2]"), ("Einstrahlung", Some("W/m2")));
        assert_eq!(split_column_unit("Udc"), ("Udc", None));
    }

    #[test]
    fn kilowatts_scale_to_watts() {
        assert_eq!(power_scale(Some("kW")), 1000.0);
        assert_eq!(power_scale(Some("W")), 1.0);
        assert_eq!(power_scale(None), 1.0);
    }
}
