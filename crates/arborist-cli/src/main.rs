mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    arborist_core::init_logging();

    let cli = Cli::parse();

    if let Commands::Init { path } = &cli.command {
        return commands::init::run_init(path);
    }

    let config = arborist_core::config::app::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Init { .. } => unreachable!(),
        Commands::Chat { project, session } => {
            commands::chat::execute(project, session, &config).await?;
        }
        Commands::Serve { host, port, project } => {
            commands::serve::execute(host, port, project, &config, cli.config.clone()).await?;
        }
    }

    Ok(())
}
