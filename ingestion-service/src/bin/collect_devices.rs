use anyhow::{bail, Context, Result};
use energy_ingestion::{
    collector::{outcomes_to_points, outcomes_to_report, ParameterCatalog, DeviceScheduler, Roster},
    config::AppConfig,
    observability,
    sinks::{ReportPublisher, TelemetryStore},
};
use serde_json::{json, Map, Value};
use std::{env, path::PathBuf};
use time::OffsetDateTime;

struct Args {
    roster: PathBuf,
    publish: bool,
    store: bool,
    output: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    const USAGE: &str = "usage: collect_devices <roster.json> [--publish] [--store] [--output <file>]";

    let mut args = env::args().skip(1);
    let mut roster = None;
    let mut parsed = Args {
        roster: PathBuf::new(),
        publish: false,
        store: false,
        output: None,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--publish" => parsed.publish = true,
            "--store" => parsed.store = true,
            "--output" => match args.next() {
                Some(path) => parsed.output = Some(PathBuf::from(path)),
                None => bail!(USAGE),
            },
            flag if flag.starts_with("--") => bail!("unknown option {flag}\n{USAGE}"),
            path => roster = Some(PathBuf::from(path)),
        }
    }

    match roster {
        Some(path) => parsed.roster = path,
        None => bail!(USAGE),
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args = parse_args()?;
    let cfg = AppConfig::load()?;

    let roster = Roster::load(&args.roster)?;
    let catalog = ParameterCatalog::load(&cfg.collector.catalog_path)?;
    if roster.is_empty() || catalog.is_empty() {
        bail!("nothing to collect: {} units, {} parameters", roster.len(), catalog.len());
    }

    let captured_at = OffsetDateTime::now_utc().to_offset(cfg.ingest.utc_offset()?);
    let outcomes = DeviceScheduler::from_config(&cfg.collector)
        .collect(&roster, &catalog)
        .await;
    let report = outcomes_to_report(&outcomes, &roster, captured_at);

    if let Some(path) = &args.output {
        let mut line = serde_json::to_vec(&report)?;
        line.push(b'\n');
        tokio::fs::write(path, line)
            .await
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote collector report");
    }

    if args.publish {
        let publisher = ReportPublisher::connect(&cfg.mqtt, "collector");
        if let Value::Object(devices) = &report {
            for (unit_key, device) in devices {
                let topic = format!("{}/{}", cfg.collector.publish_topic_prefix.trim_end_matches('/'), unit_key);
                let mut doc = Map::new();
                doc.insert(unit_key.clone(), device.clone());
                let payload = serde_json::to_vec(&doc)?;
                publisher.publish(&topic, payload).await?;
            }
        }
        publisher.finish().await?;
    }

    let points = outcomes_to_points(&outcomes, captured_at.date());
    let persisted = if args.store {
        let store = TelemetryStore::new(
            cfg.database.connect().await?,
            cfg.store.max_attempts,
            cfg.store.retry_backoff(),
        );
        Some(store.upsert_batch(&points).await?.total())
    } else {
        None
    };

    let succeeded = outcomes.iter().filter(|o| o.success).count();
    let summary = json!({
        "units": roster.len(),
        "reads": outcomes.len(),
        "succeeded": succeeded,
        "failed": outcomes.len() - succeeded,
        "points": points.len(),
        "persisted": persisted,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
