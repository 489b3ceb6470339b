mod anyproxy;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "anyproxy", version, about = "AnyProxy - reverse-tunneled proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public-facing gateway endpoint.
    Gateway {
        /// Path to the gateway config file (.yaml/.yml).
        #[arg(long, env = "ANYPROXY_CONFIG")]
        config: std::path::PathBuf,
    },
    /// Run a client (agent) endpoint inside the private network.
    Client {
        /// Path to the client config file (.yaml/.yml).
        #[arg(long, env = "ANYPROXY_CONFIG")]
        config: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Gateway { config } => anyproxy::app::run_gateway(config).await,
        Command::Client { config } => anyproxy::app::run_client(config).await,
    }
}
