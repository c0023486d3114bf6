//! devgate - project file and terminal service with HTTP API.
//!
//! Usage:
//!   devgate serve [--port 8080] [--workspace <dir>]   # Start HTTP server

use clap::{Parser, Subcommand};
use devgate::config::{self, Config};
use devgate::{http_server, AppState};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "devgate")]
#[command(about = "Session-gated project file and terminal service")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,

        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Sandbox root for the terminal and project discovery
        /// (defaults to the parent of the current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Directory served for unmatched paths
        #[arg(long, default_value = "src")]
        static_dir: PathBuf,

        /// Directory holding restart/close scripts
        #[arg(long, default_value = "scripts")]
        scripts_dir: PathBuf,

        /// Maximum concurrent sessions for non-static requests
        #[arg(long, default_value_t = config::MAX_CONCURRENT_USERS)]
        max_users: usize,

        /// Terminal command timeout in milliseconds
        #[arg(long, default_value_t = config::COMMAND_TIMEOUT_MS)]
        command_timeout_ms: u64,

        /// Argument passed to privileged scripts
        #[arg(long, default_value = config::DEFAULT_MODULE_NAME)]
        module_name: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            host,
            port,
            workspace,
            static_dir,
            scripts_dir,
            max_users,
            command_timeout_ms,
            module_name,
        } => {
            let workspace = match workspace {
                Some(dir) => dir,
                None => match std::env::current_dir() {
                    Ok(cwd) => config::default_workspace(&cwd),
                    Err(e) => {
                        eprintln!("Error: cannot determine current directory: {}", e);
                        exit(1);
                    }
                },
            };

            let mut config = Config::new(workspace);
            config.static_dir = static_dir;
            config.scripts_dir = scripts_dir;
            config.max_users = max_users;
            config.command_timeout = Duration::from_millis(command_timeout_ms);
            config.module_name = module_name;

            let state = match AppState::new(config) {
                Ok(state) => state,
                Err(e) => {
                    error!("Startup failed: {}", e);
                    exit(1);
                }
            };

            if let Err(e) = http_server::run_server(SocketAddr::new(host, port), state).await {
                error!("Server error: {}", e);
                exit(1);
            }
        }
    }
}
