use anyhow::{bail, Result};
use energy_ingestion::{
    config::AppConfig,
    observability,
    rollup::{local_today, parse_day, DailyRollup, RunStatus},
};
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    // Defaults to yesterday so the run sees the full day.
    let day = match env::args().nth(1) {
        Some(raw) => parse_day(&raw)?,
        None => {
            let today = local_today(cfg.ingest.utc_offset()?);
            match today.previous_day() {
                Some(day) => day,
                None => bail!("no day before {today}"),
            }
        }
    };

    let ledger = cfg.database.connect().await?;
    let stats = DailyRollup::new(ledger, cfg.rollup.daily_batch_size)
        .rollup_day(day)
        .await;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    if stats.status == RunStatus::Failed {
        bail!("daily rollup for {day} failed: {}", stats.error.unwrap_or_default());
    }
    Ok(())
}
