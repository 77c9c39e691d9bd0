//! latchkey — self-hosted federating identity broker

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use latchkey::{
    cli::{Cli, Command},
    setup_tracing, Config, Server,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!(error = %e, "server exited");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
