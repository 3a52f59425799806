use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "arborist")]
#[command(about = "Autonomous code-analysis agent", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scaffold a default config file
    Init {
        /// Path for the new config file
        #[arg(default_value = "arborist.toml")]
        path: PathBuf,
    },
    /// Interactive stdin/stdout REPL against the agent loop, for local debugging
    /// without the gateway
    Chat {
        /// Project key the session belongs to
        #[arg(long, default_value = "default")]
        project: String,
        /// Resume an existing session by id
        #[arg(long)]
        session: Option<String>,
    },
    /// Start the gateway plus the self-evolution loop for a configured project root
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Project key the gateway's self-evolution loop runs against
        #[arg(long, default_value = "default")]
        project: String,
    },
}
