//! scan-pilot: schedules security scanner plugins against Kubernetes clusters

use clap::{Parser, Subcommand};
use color_eyre::Result;
use kube::CustomResourceExt;
use scan_pilot_controller::ControllerConfig;
use scan_pilot_core::{Cluster, ClusterIssue, ClusterScan, DefaultPlugins, Plugin};
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::{EnvFilter, prelude::*};

/// scan-pilot: ClusterScan controller
#[derive(Parser, Debug)]
#[command(name = "scan-pilot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Namespace holding the default Plugins
    #[arg(long, default_value = "scan-pilot-system")]
    default_plugins_namespace: String,

    /// Plugins run by ClusterScans that list none (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "popeye,marvin")]
    default_plugins_names: Vec<String>,

    /// Image of the worker sidecar that stores plugin results as ClusterIssues
    #[arg(long, default_value = "ghcr.io/scan-pilot/worker:latest")]
    worker_image: String,

    /// ServiceAccount plugin Jobs run as
    #[arg(long, default_value = "scan-pilot-plugins")]
    service_account_name: String,

    /// ClusterRoleBinding granting the plugin ServiceAccounts their role
    #[arg(long, default_value = "scan-pilot-plugins")]
    cluster_role_binding_name: String,

    /// ClusterRole bound to the plugin ServiceAccounts
    #[arg(long, default_value = "scan-pilot-plugins")]
    cluster_role_name: String,

    /// Seconds between reconciliations of a healthy ClusterScan
    #[arg(long, default_value = "300")]
    requeue_interval_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the controller (default)
    Run,
    /// Print the CustomResourceDefinitions as YAML
    Crd,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            default_plugins: DefaultPlugins::new(
                self.default_plugins_namespace.clone(),
                self.default_plugins_names.clone(),
            ),
            worker_image: self.worker_image.clone(),
            service_account_name: self.service_account_name.clone(),
            cluster_role_binding_name: self.cluster_role_binding_name.clone(),
            cluster_role_name: self.cluster_role_name.clone(),
            requeue_interval: Duration::from_secs(self.requeue_interval_secs),
        }
    }
}

/// Base level from `--debug`, with noisy HTTP libraries kept at info
fn build_filter(debug: bool) -> Result<EnvFilter> {
    let filter = if debug {
        EnvFilter::from_default_env()
            .add_directive(Level::DEBUG.into())
            .add_directive("h2=info".parse()?)
            .add_directive("hyper=info".parse()?)
            .add_directive("hyper_util=info".parse()?)
            .add_directive("tower=info".parse()?)
            .add_directive("rustls=info".parse()?)
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };
    Ok(filter)
}

/// All CRDs as one multi-document YAML stream
fn crd_manifests() -> Result<String> {
    let crds = [
        Cluster::crd(),
        Plugin::crd(),
        ClusterIssue::crd(),
        ClusterScan::crd(),
    ];
    let mut out = String::new();
    for crd in &crds {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(crd)?);
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize error handling
    color_eyre::install()?;

    if cli.command == Some(Command::Crd) {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(build_filter(cli.debug)?)
        .init();

    let config = cli.controller_config();
    config.validate()?;

    tracing::info!(
        default_plugins = ?config.default_plugins.names,
        namespace = %config.default_plugins.namespace,
        worker_image = %config.worker_image,
        requeue_secs = config.requeue_interval.as_secs(),
        "Starting scan-pilot"
    );

    let client = kube::Client::try_default().await?;
    scan_pilot_controller::run(client, config).await;

    tracing::info!("Goodbye!");
    Ok(())
}
