use std::sync::Arc;

use clap::{Parser, Subcommand};
use directory_operator::{controller, crd::DirectoryCluster, telemetry, webhook, Error};
use kube::CustomResourceExt;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Print the DirectoryCluster CRD as YAML
    Crdgen,
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Serve the validating admission webhook alongside the controller
    #[arg(long, env = "ENABLE_WEBHOOK")]
    enable_webhook: bool,

    /// Listen address for the admission webhook
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:8443")]
    webhook_addr: String,

    /// PEM certificate for the webhook listener
    #[arg(long, env = "WEBHOOK_TLS_CERT")]
    webhook_tls_cert: Option<String>,

    /// PEM private key for the webhook listener
    #[arg(long, env = "WEBHOOK_TLS_KEY")]
    webhook_tls_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Crdgen => {
            let crd = serde_yaml::to_string(&DirectoryCluster::crd())
                .map_err(Error::YamlError)?;
            print!("{crd}");
            Ok(())
        }
        Commands::Version => {
            println!("directory-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    telemetry::init_tracing();

    info!(
        "Starting directory-operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    if args.enable_webhook {
        let addr = args
            .webhook_addr
            .parse()
            .map_err(|e| Error::ConfigError(format!("invalid webhook address: {e}")))?;

        let tls = match (args.webhook_tls_cert, args.webhook_tls_key) {
            (Some(cert_path), Some(key_path)) => Some(webhook::TlsConfig {
                cert_path,
                key_path,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::ConfigError(
                    "webhook TLS requires both a certificate and a key".to_string(),
                ))
            }
        };

        let webhook_state = Arc::new(webhook::WebhookState {
            client: client.clone(),
        });

        tokio::spawn(async move {
            if let Err(e) = webhook::run_webhook(webhook_state, addr, tls).await {
                error!("Admission webhook error: {:?}", e);
            }
        });
    }

    let state = Arc::new(controller::ControllerState { client });

    controller::run_controller(state).await
}
