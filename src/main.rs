//! Demo CLI binary.
//!
//! The real CLI front-end (manifest parsing, env plumbing, terminal
//! handling) is an external collaborator; this binary only exercises the
//! engine directly, mirroring how a caller would wire one up.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use forge_engine::{Engine, EngineConfig};

#[derive(Parser)]
#[command(name = "forge-engine")]
#[command(about = "Buildpack container engine demo CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the daemon's Unix-domain socket.
    #[arg(long, env = "DOCKER_SOCKET")]
    socket: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull an image and report progress.
    Pull { reference: String },
    /// Print engine configuration and exit.
    Diagnostics,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("forge_engine={}", log_level).into()),
        )
        .init();

    info!("forge-engine v{}", env!("CARGO_PKG_VERSION"));

    let mut config = EngineConfig::from_env();
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    let engine = Engine::new(config);

    match cli.command {
        Commands::Diagnostics => {
            println!("socket: {}", engine.config().socket_path);
            println!("tick: {:?}", engine.config().tick);
        }
        Commands::Pull { reference } => {
            let image = engine.image(reference);
            if let Err(e) = image.pull(|p| info!(?p, "pull progress")).await {
                error!("pull failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
