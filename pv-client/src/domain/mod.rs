pub mod measurement;

pub use measurement::{MetadataValue, UnifiedMeasurement, GOLDEN_METRIC_KEYS};
