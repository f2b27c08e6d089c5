use serde::Deserialize;
use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use ledger_client::PgLedger;
use time::UtcOffset;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub async fn connect(&self) -> anyhow::Result<Arc<PgLedger>> {
        let ledger = PgLedger::connect(&self.uri, self.max_connections)
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect to ledger database: {e}"))?;
        Ok(Arc::new(ledger))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "energy-ingestion".to_string(),
            username: None,
            password: None,
            topic: "/datacollection/plc/to/collector/#".to_string(),
            qos: 1,
            keep_alive_secs: 60,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub keepalive_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 500,
            keepalive_interval_secs: 300,
        }
    }
}

impl StoreConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub workers: usize,
    pub session_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub catalog_path: PathBuf,
    pub publish_topic_prefix: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            session_timeout_secs: 30,
            connect_timeout_ms: 3_000,
            request_timeout_ms: 2_000,
            catalog_path: PathBuf::from("plc-parameters.json"),
            publish_topic_prefix: "/datacollection/plc/to/collector".to_string(),
        }
    }
}

impl CollectorConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Offset of the site's local calendar from UTC, in minutes.
    pub utc_offset_minutes: i32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { utc_offset_minutes: 480 }
    }
}

impl IngestConfig {
    pub fn utc_offset(&self) -> anyhow::Result<UtcOffset> {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes * 60)
            .map_err(|e| anyhow::anyhow!("invalid ingest.utc_offset_minutes {}: {e}", self.utc_offset_minutes))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    pub daily_batch_size: usize,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self { daily_batch_size: 100 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub stale_after_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { stale_after_secs: 600 }
    }
}

/// Controller mode writes and the matching bus command.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub targets_path: PathBuf,
    pub topic: String,
    pub screen_mac: String,
    pub device_sn: u64,
    pub attr_tag: String,
    pub product_code: String,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            targets_path: PathBuf::from("plc_mode_update_config.json"),
            topic: "/system/mode".to_string(),
            screen_mac: String::new(),
            device_sn: 21_996,
            attr_tag: "mode".to_string(),
            product_code: "10016".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub rollup: RollupConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub mode: ModeConfig,
    pub metrics: Option<MetricsConfig>,
}

fn default_max_connections() -> u32 {
    5
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("ENERGY_INGEST_CONFIG").unwrap_or_else(|_| "energy-ingest.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.ingest.utc_offset()?;
        Ok(cfg)
    }
}
