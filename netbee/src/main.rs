use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::io::BufReader;

use netbee::{
    NetBeeEngine,
    analyzer::{Consumer, JsonLinesConsumer},
    settings::Settings,
    telemetry,
};

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Newline-delimited JSON events to replay; reads stdin when omitted
    #[clap(short, long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let settings = Settings::new().context("Failed to load settings")?;
    if let Err(e) = telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref()) {
        warn!("Failed to initialize metrics: {:#}", e);
    }

    let consumers: Vec<Arc<dyn Consumer>> = vec![Arc::new(JsonLinesConsumer)];
    let engine = NetBeeEngine::new(settings, consumers, None);

    let result = match opt.input {
        Some(path) => {
            info!("Replaying events from {}", path.display());
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            engine.run(BufReader::new(file)).await
        }
        None => engine.run(BufReader::new(tokio::io::stdin())).await,
    };

    telemetry::shutdown_metrics();
    result
}
