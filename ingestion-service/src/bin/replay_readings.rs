use anyhow::{bail, Result};
use energy_ingestion::{
    config::AppConfig,
    ingest::Ingestor,
    observability,
    pipeline::{Pipeline, PointBatch, RawMessage, Transform},
    sources::ReplayFileSource,
};
use std::{env, sync::Arc};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: replay_readings <payload_file> [topic]");
    }
    let file_path = &args[1];
    let topic = args.get(2).map(String::as_str).unwrap_or("/replay");

    let cfg = AppConfig::load()?;
    let ingestor = Ingestor::from_config(&cfg, cfg.database.connect().await?)?;

    let normalize: Arc<dyn Transform<RawMessage, PointBatch> + Send + Sync> = ingestor.normalizer;
    let validation: Arc<dyn Transform<PointBatch, PointBatch> + Send + Sync> = ingestor.validation;
    let pipeline: Pipeline<_, RawMessage, PointBatch, _> = Pipeline {
        source: ReplayFileSource::new(file_path, topic),
        normalize,
        transforms: vec![validation],
        sink: ingestor.sink,
    };

    pipeline.run().await?;

    Ok(())
}
