use std::sync::Arc;

use ledger_client::{LedgerStore, UpsertStats};

use crate::config::AppConfig;
use crate::pipeline::{Envelope, PipelineError, RawMessage, Transform};
use crate::sinks::{TelemetryStore, TelemetryStoreSink};
use crate::status::StatusTracker;
use crate::transform::{Normalizer, PointValidation};

/// The push-path stages for one message at a time: normalize, validate,
/// persist.
pub struct Ingestor {
    pub normalizer: Arc<Normalizer>,
    pub validation: Arc<PointValidation>,
    pub sink: TelemetryStoreSink,
}

impl Ingestor {
    pub fn from_config(cfg: &AppConfig, ledger: Arc<dyn LedgerStore>) -> anyhow::Result<Self> {
        let normalizer = Normalizer::new(cfg.ingest.utc_offset()?)?;
        let store = TelemetryStore::new(ledger.clone(), cfg.store.max_attempts, cfg.store.retry_backoff());
        Ok(Self {
            normalizer: Arc::new(normalizer),
            validation: Arc::new(PointValidation),
            sink: TelemetryStoreSink::new(store, Some(StatusTracker::new(ledger))),
        })
    }

    /// Ingest a single message. Returns how many telemetry rows were written.
    pub async fn ingest(&self, raw: RawMessage) -> Result<UpsertStats, PipelineError> {
        let env = self.normalizer.apply(Envelope::now(raw)).await?;
        let env = self.validation.apply(env).await?;
        self.sink
            .persist(&env)
            .await
            .map_err(|e| PipelineError::Sink(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use ledger_client::{domain::EnergyMode, MemoryLedger};
    use time::macros::date;

    use super::*;

    fn config() -> AppConfig {
        AppConfig::from_toml("[database]\nuri = \"postgres://unused\"\n[store]\nretry_backoff_ms = 1\n").unwrap()
    }

    #[tokio::test]
    async fn canonical_message_lands_in_the_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let ingestor = Ingestor::from_config(&config(), ledger.clone()).unwrap();

        let payload = r#"{"9-1-3104": {"PLC IP地址": "10.0.0.7", "data": {
            "total_hot_quantity": {"value": 10100, "success": true, "message": "ok", "timestamp": "2025-01-10 08:00:00"},
            "total_cold_quantity": {"value": null, "success": false, "message": "timeout", "timestamp": "2025-01-10 08:00:00"}
        }}}"#;
        let stats = ingestor
            .ingest(RawMessage::new("/datacollection/plc/to/collector/gw1", payload))
            .await
            .unwrap();

        assert_eq!(stats.created, 1);
        let stored = ledger
            .telemetry("9-1-3104", EnergyMode::Heating, date!(2025 - 01 - 10))
            .await
            .unwrap();
        assert_eq!(stored.raw_counter_value, 10_100);
        assert!(ledger
            .telemetry("9-1-3104", EnergyMode::Cooling, date!(2025 - 01 - 10))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn undecodable_message_is_an_error() {
        let ingestor = Ingestor::from_config(&config(), Arc::new(MemoryLedger::new())).unwrap();
        let res = ingestor.ingest(RawMessage::new("/gw/1", "%%%")).await;
        assert!(matches!(res, Err(PipelineError::Transform(_))));
    }
}
