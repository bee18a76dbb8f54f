//! `vidgen-worker` -- runs a single video generation job.
//!
//! Reads the job JSON from the file named by the first argument, or from
//! stdin when no argument is given, and prints the result JSON on stdout.
//! Exits with status 1 when the job fails. Logs go to stderr.
//!
//! See [`HandlerConfig::from_env`] for the environment variables.

use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vidgen_worker::config::HandlerConfig;
use vidgen_worker::handler::JobHandler;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "vidgen_worker=info,vidgen_comfyui=info,vidgen_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = HandlerConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let raw = read_job(std::env::args().nth(1)).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to read job");
        std::process::exit(1);
    });

    let job: serde_json::Value = serde_json::from_str(&raw).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Job is not valid JSON");
        std::process::exit(1);
    });

    tracing::info!(
        api_url = %config.api_url(),
        workflow = %config.workflow_path.display(),
        "Starting vidgen-worker",
    );

    let response = JobHandler::new(config).handle_value(job).await;

    match serde_json::to_string(&response) {
        Ok(body) => println!("{body}"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize response");
            std::process::exit(1);
        }
    }

    if response.is_failure() {
        std::process::exit(1);
    }
}

/// Job JSON from `path`, or stdin when no path is given.
async fn read_job(path: Option<String>) -> std::io::Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path).await,
        None => {
            let mut raw = String::new();
            tokio::io::stdin().read_to_string(&mut raw).await?;
            Ok(raw)
        }
    }
}
