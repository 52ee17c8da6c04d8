//! agent-sandbox - sandboxed execution for AI agents.
//!
//! Usage:
//!   agent-sandbox serve [--bind 0.0.0.0:8080] ...          # Run the cluster provisioner
//!   agent-sandbox exec --sandbox-id ID [--mode M] -- <cmd>  # Run one command via the façade

use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use agent_sandbox::cluster::ProvisionerConfig;
use agent_sandbox::{http_server, SandboxConfig, SandboxIdentity, SandboxMode, SandboxOverrides, SandboxService};

#[derive(Parser, Debug)]
#[command(name = "agent-sandbox")]
#[command(about = "Sandboxed command execution and file access for AI agents")]
struct Args {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the cluster provisioner (HTTP API + idle reaper)
    Serve {
        #[command(flatten)]
        config: ProvisionerConfig,
    },
    /// Run one command in a sandbox and exit with its exit code
    Exec {
        /// Sandbox to run in
        #[arg(long)]
        sandbox_id: Option<String>,

        /// Conversation thread the sandbox belongs to
        #[arg(long)]
        thread_id: Option<String>,

        /// Backend to use (overrides SANDBOX_MODE)
        #[arg(long, value_enum)]
        mode: Option<SandboxMode>,

        /// Host directory holding per-sandbox workspaces
        #[arg(long)]
        workspace_root: Option<PathBuf>,

        /// Command timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Command to run (passed to `sh -c`)
        #[arg(last = true, required = true)]
        cmd_args: Vec<String>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Commands::Serve { config } => {
            if let Err(e) = http_server::run_server(config).await {
                error!(error = %e, "provisioner failed");
                exit(1);
            }
        }
        Commands::Exec {
            sandbox_id,
            thread_id,
            mode,
            workspace_root,
            timeout,
            cmd_args,
        } => {
            let overrides = SandboxOverrides {
                mode,
                workspace_root,
                timeout_seconds: timeout,
                ..Default::default()
            };
            let config = match SandboxConfig::from_env(&overrides) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(2);
                }
            };
            let identity = SandboxIdentity {
                thread_id,
                sandbox_id,
                ..Default::default()
            };
            let command = cmd_args.join(" ");
            match SandboxService::default().execute(&config, &identity, &command).await {
                Ok(result) => {
                    println!("{}", result.output);
                    exit(result.exit_code);
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
    }
}
