mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use nat_tunnel::config::ServerEnv;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("nat-tunnel v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Server { config } => {
            info!("Loading server configuration from: {}", config);
            let env = ServerEnv::from_file(config)?;
            nat_tunnel::server::run_server(env).await?;
        }
        Commands::Check { config } => {
            ServerEnv::from_file(config)?;
            println!("Configuration OK: {}", config);
        }
    }

    Ok(())
}
