use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

/// meld: Replicated key-value node.
///
/// Serve a database over HTTP, keep it in sync with peers, and read or
/// write keys on a running node.
#[derive(Parser)]
#[command(name = "meld", version, about, long_about = None)]
struct Cli {
    /// Path to the node configuration file.
    #[arg(short, long, env = "MELD_CONFIG", default_value = "meld.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node: serve the HTTP API and pull from every configured peer.
    Serve {
        /// Override the listen address from the config file.
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Pull once from one peer, or from every configured peer.
    Sync {
        /// Peer id from the config file.
        peer: Option<String>,
    },

    /// Show the local version, item count and time vector.
    ///
    /// Opens the storage directly, so stop a running node on file backends first.
    Status,

    /// Read a key from a running node.
    Get {
        key: String,

        /// Node address. Defaults to the configured listen address.
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Write a key on a running node.
    ///
    /// LWW databases take one value; table databases take name=value fields.
    Put {
        key: String,

        #[arg(required = true)]
        values: Vec<String>,

        /// Node address. Defaults to the configured listen address.
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Delete a key on a running node.
    Delete {
        key: String,

        /// Node address. Defaults to the configured listen address.
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Print every key a running node holds.
    Dump {
        /// Node address. Defaults to the configured listen address.
        #[arg(short, long)]
        addr: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meld=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = config::load_from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve { listen } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            commands::serve(&config).await
        }
        Commands::Sync { peer } => commands::sync(&config, peer.as_deref()).await,
        Commands::Status => commands::status(&config),
        Commands::Get { key, addr } => commands::get(&config, addr.as_deref(), &key).await,
        Commands::Put { key, values, addr } => {
            commands::put(&config, addr.as_deref(), &key, &values).await
        }
        Commands::Delete { key, addr } => commands::delete(&config, addr.as_deref(), &key).await,
        Commands::Dump { addr } => commands::dump(&config, addr.as_deref()).await,
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
