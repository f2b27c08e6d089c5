use anyhow::{bail, Result};
use energy_ingestion::{
    config::AppConfig,
    observability,
    rollup::{local_today, MonthlyRollup, RunStatus},
};
use ledger_client::domain::UsageMonth;
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    // Defaults to the previous calendar month.
    let month = match env::args().nth(1) {
        Some(raw) => raw.parse::<UsageMonth>()?,
        None => UsageMonth::of(local_today(cfg.ingest.utc_offset()?)).previous(),
    };

    let ledger = cfg.database.connect().await?;
    let stats = MonthlyRollup::new(ledger).rollup_month(month).await;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    if stats.status == RunStatus::Failed {
        bail!("monthly rollup for {month} failed: {}", stats.error.unwrap_or_default());
    }
    Ok(())
}
