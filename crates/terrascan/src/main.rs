//! One-shot ingestion: loads a config file, recovers interrupted jobs and
//! ingests every scene matching the configured search.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use terrascan::{load_config, telemetry, TerraScan};

#[tokio::main]
async fn main() -> ExitCode {
    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: terrascan <config.json>");
        return ExitCode::from(2);
    };

    match run(&path).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(path: &str) -> terrascan::Result<ExitCode> {
    let config = load_config(path)?;
    telemetry::init(&config.logging)?;
    info!("terrascan v{} starting", env!("CARGO_PKG_VERSION"));

    let scan = Arc::new(TerraScan::from_config(&config)?);
    let recovered = scan.jobs().recover_interrupted()?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "Recovered interrupted jobs");
    }

    let Some(search) = &config.search else {
        info!("No search configured, nothing to ingest");
        return Ok(ExitCode::SUCCESS);
    };

    let interrupt = CancellationToken::new();
    let handler_token = interrupt.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!(error = %e, "Failed to install Ctrl+C handler");
    }
    let stopper = {
        let scan = Arc::clone(&scan);
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            interrupt.cancelled().await;
            warn!("Interrupt received, stopping");
            scan.shutdown().await;
        })
    };

    let report = scan
        .ingest(&search.to_query(&config.stac.collections))
        .await?;
    stopper.abort();

    let ready = report.ready().count();
    let failed: Vec<_> = report.failed().collect();
    println!(
        "{} scene(s): {} ready, {} failed, {} incomplete",
        report.scenes.len(),
        ready,
        failed.len(),
        report.scenes.len() - ready - failed.len()
    );
    for scene in &failed {
        println!(
            "  {}: {}",
            scene.scene_id,
            scene.error.as_deref().unwrap_or("unknown error")
        );
    }

    if failed.is_empty() && !interrupt.is_cancelled() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
