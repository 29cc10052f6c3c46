use anyhow::Result;
use clap::{Parser, Subcommand};
use logrelay::context::AppContext;
use logrelay::supervisor::Supervisor;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "logrelay")]
#[command(about = "Multi-source log ingestion and forwarding service")]
#[command(version)]
struct Cli {
    /// Base directory for persisted state files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for the service's own diagnostic logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion data plane until interrupted
    Run {
        /// PID file path, forwarded to the external lifecycle wrapper
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Service log file path, forwarded to the external lifecycle wrapper
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Suppress the external operator terminal and run the data plane only
        #[arg(long)]
        non_interactive: bool,
    },
    /// Load and validate persisted state, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let base = AppContext::default_base_dir();
    let ctx = AppContext::new(
        cli.data_dir.unwrap_or_else(|| base.join("data")),
        cli.log_dir.unwrap_or_else(|| base.join("logs")),
    )?;

    match cli.command {
        Commands::Run {
            pid_file,
            log_file,
            non_interactive,
        } => {
            // PID and service-log handling belong to the external lifecycle
            // wrapper; the paths are accepted here so wrappers can drive a
            // single entrypoint.
            if let Some(path) = pid_file {
                debug!("PID file managed externally: {}", path.display());
            }
            if let Some(path) = log_file {
                debug!("Service log managed externally: {}", path.display());
            }
            if non_interactive {
                info!("Running non-interactively");
            }

            let mut supervisor = Supervisor::new(ctx)?;
            supervisor.start().await?;

            tokio::signal::ctrl_c().await?;
            info!("Interrupt received, shutting down");
            supervisor.stop().await;
        }
        Commands::Check => {
            let supervisor = Supervisor::new(ctx)?;
            let sources = supervisor.registry().sources();
            println!("Configuration OK: {} source(s)", sources.len());
            for source in sources.values() {
                println!(
                    "  {} {}:{} -> {} (batch {})",
                    source.protocol,
                    source.peer_ip,
                    source.port,
                    source.target.kind(),
                    source.batch_size()
                );
            }
        }
    }

    Ok(())
}
