use anyhow::{bail, Context, Result};
use energy_ingestion::{
    config::AppConfig,
    observability,
    repair::LedgerRepair,
    rollup::{local_today, parse_day},
};
use std::env;

const USAGE: &str = "usage: ledger_repair close-day <YYYY-MM-DD>\n       ledger_repair copy-day <from YYYY-MM-DD> <to YYYY-MM-DD>\n       ledger_repair purge <keep_days>";

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    let cfg = AppConfig::load()?;
    let repair = LedgerRepair::new(cfg.database.connect().await?);

    match (command.as_str(), &args[1..]) {
        ("close-day", [day]) => {
            let closed = repair.close_silent_day(parse_day(day)?).await?;
            println!("closed {closed} silent day rows");
        }
        ("copy-day", [from, to]) => {
            let copied = repair.copy_day(parse_day(from)?, parse_day(to)?).await?;
            println!("copied {copied} readings");
        }
        ("purge", [keep_days]) => {
            let keep_days: u32 = keep_days
                .parse()
                .with_context(|| format!("invalid keep_days '{keep_days}'"))?;
            let today = local_today(cfg.ingest.utc_offset()?);
            let purged = repair.purge_older_than(today, keep_days).await?;
            println!("purged {} telemetry and {} daily rows", purged.telemetry, purged.daily);
        }
        _ => bail!(USAGE),
    }

    Ok(())
}
