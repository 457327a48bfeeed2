//! # Shared Resource Operator
//!
//! Installs and keeps converged the shared resource CSI driver:
//!
//! 1. **CRDs and default config** - `SharedSecret`, `SharedConfigMap` and the
//!    driver ConfigMap are recreated if deleted out-of-band
//! 2. **Webhook Deployment** - rendered through the manifest hook pipeline and
//!    re-applied when the operator, infrastructure, nodes or serving secret change
//! 3. **Static resources** - CSIDriver, RBAC, services and the node DaemonSet
//! 4. **Metrics** - shared resource counts and operator self-metrics on `/metrics`
//!
//! ## Usage
//!
//! ```text
//! shared-resource-operator start [--kubeconfig PATH]
//! ```
//!
//! Without `--kubeconfig` the in-cluster service account is used.

use clap::{CommandFactory, Parser, Subcommand};
use shared_resource_operator::config::OperatorConfig;
use shared_resource_operator::observability::logging::init_tracing;
use shared_resource_operator::runtime::initialization::{
    build_client, cancel_on_signal, install_crypto_provider,
};
use shared_resource_operator::runtime::{run_operator, ExitReason};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

/// Shared resource CSI driver operator
#[derive(Parser)]
#[command(name = "shared-resource-operator", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the operator
    Start {
        /// Path to a kubeconfig file; in-cluster credentials are used when omitted
        #[arg(long, value_name = "PATH")]
        kubeconfig: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Some(Commands::Start { kubeconfig }) = cli.command else {
        // Printing help only fails when stdout is gone
        let _ = Cli::command().print_help();
        return ExitCode::FAILURE;
    };

    // Must run before the first TLS connection
    install_crypto_provider();

    let config = OperatorConfig::from_env();
    let log_levels = init_tracing(&config.log_level);

    let client = match build_client(kubeconfig.as_deref()).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("shared-resource-operator: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let root = CancellationToken::new();
    cancel_on_signal(root.clone());

    match run_operator(config, client, Some(log_levels), root).await {
        Ok(ExitReason::Cancelled) => ExitCode::SUCCESS,
        Ok(reason @ ExitReason::ComponentExited(_)) => {
            eprintln!("shared-resource-operator: {reason}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("shared-resource-operator: {e:#}");
            ExitCode::FAILURE
        }
    }
}
