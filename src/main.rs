//! flowmesh operator - reconciles the flow collection pipeline

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use flowmesh::client::FIELD_MANAGER;
use flowmesh::config::OperatorConfig;
use flowmesh::controller;
use flowmesh::crd::FlowCollector;
use flowmesh::retry::{retry_with_backoff, RetryConfig};
use flowmesh::telemetry::{init_logging, LogFormat};

/// flowmesh - Kubernetes operator for network-flow collection pipelines
#[derive(Parser, Debug)]
#[command(name = "flowmesh", version, about, long_about = None)]
struct Cli {
    /// Generate the FlowCollector CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, env = "FLOWMESH_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconcile loops (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube's TLS stack needs a process-wide crypto provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&FlowCollector::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_logging(cli.log_format)?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!(?config, "starting flowmesh operator");
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if config.skip_crd_install {
        tracing::info!("CRD installation skipped");
    } else {
        ensure_crd_installed(&client).await?;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    controller::run(client, &config, shutdown).await;
    tracing::info!("flowmesh operator shutting down");
    Ok(())
}

/// Install or update the FlowCollector CRD with server-side apply.
///
/// The API server may still be starting when the operator comes up, so the
/// apply is retried a few times.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = FlowCollector::crd();
    let name = format!("flowcollectors.{}", crd.spec.group);
    let patch = Patch::Apply(&crd);

    tracing::info!(crd = %name, "Installing FlowCollector CRD...");
    retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_crd", || {
        crds.patch(&name, &params, &patch)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install FlowCollector CRD: {}", e))?;

    tracing::info!("FlowCollector CRD installed/updated");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    tracing::info!("shutdown signal received, finishing in-flight passes");
    token.cancel();
}
