mod node;
mod server;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use strata_core::{StrataConfig, StrataError};

use server::{build_controller, build_registry, run_server};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Distributed, content-addressed, commit-oriented filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a storage node (and gateway)
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Run the role-assignment controller
    Controller {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("starting Strata server with config: {}", config);
            let cfg = match StrataConfig::from_file(&config) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::error!("failed to load config: {}", err);
                    std::process::exit(1);
                }
            };
            if let Err(err) = run_server(cfg).await {
                tracing::error!("server error: {}", err);
                std::process::exit(1);
            }
        }
        Commands::Controller { config } => {
            tracing::info!("starting Strata controller with config: {}", config);
            let cfg = match StrataConfig::from_file(&config) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::error!("failed to load config: {}", err);
                    std::process::exit(1);
                }
            };
            let registry = match build_registry(&cfg).await {
                Ok(registry) => registry,
                Err(err) => {
                    tracing::error!("failed to connect to registry: {}", err);
                    std::process::exit(1);
                }
            };
            let controller = build_controller(&cfg, registry);

            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                });
            }
            match controller.assign_roles(cancel).await {
                Err(StrataError::Cancelled) => {
                    tracing::info!("controller shut down");
                }
                Err(err) => {
                    tracing::error!("controller error: {}", err);
                    std::process::exit(1);
                }
                Ok(()) => {}
            }
        }
    }
}
