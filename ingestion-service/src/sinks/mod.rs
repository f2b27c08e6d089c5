pub mod mqtt_report;
pub mod telemetry_store;

pub use mqtt_report::ReportPublisher;
pub use telemetry_store::{prepare_batch, SinkTotals, TelemetryStore, TelemetryStoreSink};
