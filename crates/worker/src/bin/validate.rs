//! `vidgen-validate` -- checks the workflow template against a running
//! ComfyUI instance.
//!
//! Fetches `/object_info`, reports unknown node classes, unknown inputs
//! and missing required inputs, and prints the report JSON on stdout.
//! Exits with status 1 when the template is invalid or the server cannot
//! be queried. Uses the same environment variables as `vidgen-worker`.

use std::collections::BTreeSet;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vidgen_comfyui::api::ComfyUIApi;
use vidgen_core::validation::{node_signature, validate_workflow};
use vidgen_core::workflow::Workflow;
use vidgen_worker::config::HandlerConfig;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vidgen_validate=info,vidgen_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = HandlerConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let workflow = Workflow::load(&config.workflow_path).unwrap_or_else(|e| {
        tracing::error!(path = %config.workflow_path.display(), error = %e, "Failed to load workflow");
        std::process::exit(1);
    });
    tracing::info!(
        path = %config.workflow_path.display(),
        nodes = workflow.node_ids().count(),
        "Loaded workflow",
    );

    let api = ComfyUIApi::new(config.api_url());
    let object_info = api.get_object_info().await.unwrap_or_else(|e| {
        tracing::error!(api_url = %api.api_url(), error = %e, "ComfyUI not responding");
        std::process::exit(1);
    });
    tracing::info!(
        definitions = object_info.as_object().map_or(0, |defs| defs.len()),
        "Fetched node definitions",
    );

    let classes: BTreeSet<&str> = workflow
        .node_ids()
        .filter_map(|id| workflow.class_type(id))
        .collect();
    for class in classes {
        match node_signature(&object_info, class) {
            Some(sig) => tracing::info!(
                class,
                required = ?sig.required,
                optional = ?sig.optional,
                outputs = ?sig.outputs,
                "Node definition",
            ),
            None => tracing::warn!(class, "Node class not installed"),
        }
    }

    let report = validate_workflow(&workflow, &object_info);
    for issue in &report.issues {
        tracing::error!(%issue, "Validation error");
    }

    match serde_json::to_string_pretty(&report) {
        Ok(body) => println!("{body}"),
        Err(e) => tracing::error!(error = %e, "Failed to serialize report"),
    }

    if report.is_valid() {
        tracing::info!(nodes_checked = report.nodes_checked, "Workflow is valid");
    } else {
        tracing::error!(issues = report.issues.len(), "Workflow is invalid");
        std::process::exit(1);
    }
}
