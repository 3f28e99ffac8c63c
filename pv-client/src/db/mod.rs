pub mod measurement_queries;

pub use measurement_queries::{latest_measurement, measurement_window, upsert_measurements};
