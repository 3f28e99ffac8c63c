use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Metadata slot names reserved for the three typed golden-metric columns.
/// `UnifiedMeasurement::insert_metadata` refuses these keys so the open map
/// can never shadow a typed field.
pub const GOLDEN_METRIC_KEYS: [&str; 3] = ["activePowerWatts", "energyDailyKwh", "irradiance"];

/// A single metadata value: numeric reading, device state string, or an
/// explicit "no reading" marker. Serializes as plain JSON number/string/null
/// for the `jsonb` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Number(f64),
    Text(String),
    Null,
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Number(v)
    }
}

impl From<Option<f64>> for MetadataValue {
    fn from(v: Option<f64>) -> Self {
        match v {
            Some(n) => MetadataValue::Number(n),
            None => MetadataValue::Null,
        }
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Text(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Text(v.to_string())
    }
}

/// The canonical time-series record every vendor format normalizes into.
///
/// `(logger_id, timestamp)` is the natural key; re-ingesting the same logical
/// reading replaces the stored row. The three golden metrics stay `None` when
/// the source did not report them or reported a sentinel value -- a stored
/// zero always means a real measured zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMeasurement {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub logger_id: String,
    pub logger_type: String,
    pub active_power_watts: Option<f64>,
    pub energy_daily_kwh: Option<f64>,
    pub irradiance: Option<f64>,
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl UnifiedMeasurement {
    pub fn new(
        timestamp: OffsetDateTime,
        logger_id: impl Into<String>,
        logger_type: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            logger_id: logger_id.into(),
            logger_type: logger_type.into(),
            active_power_watts: None,
            energy_daily_kwh: None,
            irradiance: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Inserts a metadata entry unless the key names a golden-metric slot.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let key = key.into();
        if GOLDEN_METRIC_KEYS.contains(&key.as_str()) {
            return;
        }
        self.metadata.insert(key, value.into());
    }

    pub fn natural_key(&self) -> (&str, OffsetDateTime) {
        (&self.logger_id, self.timestamp)
    }
}
