use std::{sync::Arc, time::Duration};

use anyhow::Result;
use energy_ingestion::{
    config::AppConfig,
    ingest::Ingestor,
    maintenance, metrics_server, observability,
    pipeline::{Pipeline, PointBatch, RawMessage, Transform},
    sources::MqttSource,
    status::StatusTracker,
};
use ledger_client::LedgerStore;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let ledger: Arc<dyn LedgerStore> = cfg.database.connect().await?;
    let ingestor = Ingestor::from_config(&cfg, ledger.clone())?;

    let shutdown = CancellationToken::new();
    let mut keepalive =
        maintenance::start_storage_keepalive(ledger.clone(), cfg.store.keepalive_interval(), &shutdown);
    let stale_after = Duration::from_secs(cfg.status.stale_after_secs.max(1));
    let mut sweep = maintenance::start_status_sweep(
        StatusTracker::new(ledger.clone()),
        stale_after,
        (stale_after / 2).max(Duration::from_secs(1)),
        &shutdown,
    );

    let normalize: Arc<dyn Transform<RawMessage, PointBatch> + Send + Sync> = ingestor.normalizer;
    let validation: Arc<dyn Transform<PointBatch, PointBatch> + Send + Sync> = ingestor.validation;
    let pipeline: Pipeline<_, RawMessage, PointBatch, _> = Pipeline {
        source: MqttSource::new(cfg.mqtt.clone()),
        normalize,
        transforms: vec![validation],
        sink: ingestor.sink,
    };

    tracing::info!(topic = %cfg.mqtt.topic, host = %cfg.mqtt.host, "energy ingestion service started");
    tokio::select! {
        res = pipeline.run() => {
            res?;
            tracing::warn!("message stream ended");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    shutdown.cancel();
    keepalive.stop().await;
    sweep.stop().await;

    Ok(())
}
