pub mod collector;
pub mod config;
pub mod ingest;
pub mod maintenance;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod repair;
pub mod rollup;
pub mod s7;
pub mod sinks;
pub mod sources;
pub mod status;
pub mod transform;

pub use pipeline::{Envelope, Pipeline};
