use anyhow::{bail, Result};
use energy_ingestion::{
    collector::{
        mode::{command_topic, mode_command, outcomes_by_unit},
        DeviceScheduler, ModeTargets, Roster, SystemMode,
    },
    config::AppConfig,
    observability,
    sinks::ReportPublisher,
};
use serde_json::json;
use std::{env, path::PathBuf};

struct Args {
    mode: SystemMode,
    roster: Option<PathBuf>,
    publish: bool,
}

fn parse_args() -> Result<Args> {
    const USAGE: &str = "usage: system_mode <cooling|heating|ventilation> [roster.json] [--publish]\n\
        writes the mode into every controller of the roster and/or publishes it on the bus";

    let mut args = env::args().skip(1);
    let Some(mode) = args.next() else {
        bail!(USAGE);
    };
    let mut parsed = Args {
        mode: mode.parse()?,
        roster: None,
        publish: false,
    };

    for arg in args {
        match arg.as_str() {
            "--publish" => parsed.publish = true,
            flag if flag.starts_with("--") => bail!("unknown option {flag}\n{USAGE}"),
            path => parsed.roster = Some(PathBuf::from(path)),
        }
    }

    if parsed.roster.is_none() && !parsed.publish {
        bail!(USAGE);
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args = parse_args()?;
    let cfg = AppConfig::load()?;

    let mut summary = json!({ "mode": args.mode, "code": args.mode.code() });

    if let Some(path) = &args.roster {
        let roster = Roster::load(path)?;
        let targets = ModeTargets::load(&cfg.mode.targets_path)?;
        if roster.is_empty() || targets.is_empty() {
            bail!("nothing to write: {} units, {} targets", roster.len(), targets.len());
        }

        let outcomes = DeviceScheduler::from_config(&cfg.collector)
            .write_mode(&roster, &targets, args.mode)
            .await;
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        summary["writes"] = json!(outcomes.len());
        summary["succeeded"] = json!(succeeded);
        summary["failed"] = json!(outcomes.len() - succeeded);
        summary["units"] = outcomes_by_unit(&outcomes);
    }

    if args.publish {
        if cfg.mode.screen_mac.is_empty() {
            bail!("mode.screen_mac must be configured to publish a mode command");
        }
        let publisher = ReportPublisher::connect(&cfg.mqtt, "mode");
        let topic = command_topic(&cfg.mode);
        let command = mode_command(args.mode, 1, &cfg.mode);
        publisher.publish(&topic, serde_json::to_vec(&command)?).await?;
        publisher.finish().await?;
        summary["published"] = json!(topic);
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
