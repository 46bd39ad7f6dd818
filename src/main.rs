use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use lcsm_server::protocol::{CONTROL_SOCKET_PATH, InstanceId, NewInstance, PageQuery};
use lcsm_server::{
    PanelConfig, Runner, RunnerClient, RunnerClients, RunnerConfig, RunnerSettings,
    StaticDirectory,
};

/// LCSM - panel and runner for managed server instances
#[derive(Parser)]
#[command(name = "lcsm", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the runner control socket (default)
    Runner(RunnerArgs),
    /// List instances on a runner
    List {
        #[command(flatten)]
        target: TargetArgs,
        /// Page number, starting at 1
        #[arg(long, default_value = "1")]
        page: i64,
        /// Instances per page
        #[arg(long, default_value = "10")]
        page_size: i64,
    },
    /// Create an instance on a runner
    Add {
        #[command(flatten)]
        target: TargetArgs,
        /// Instance name
        #[arg(long)]
        name: String,
        /// Command line that starts the instance
        #[arg(long)]
        launch_command: String,
        /// Free-form description
        #[arg(long, default_value = "")]
        description: String,
        /// Working directory (defaults to the runner's data dir)
        #[arg(long)]
        working_directory: Option<String>,
    },
    /// Start an instance's process
    Start {
        #[command(flatten)]
        target: TargetArgs,
        id: InstanceId,
    },
    /// Ask an instance's process to exit
    Stop {
        #[command(flatten)]
        target: TargetArgs,
        id: InstanceId,
    },
    /// Kill an instance's process
    Kill {
        #[command(flatten)]
        target: TargetArgs,
        id: InstanceId,
    },
    /// Delete a stopped instance
    Delete {
        #[command(flatten)]
        target: TargetArgs,
        id: InstanceId,
    },
}

#[derive(Args, Default)]
struct RunnerArgs {
    /// Address to listen on (`host:port` or `:port`)
    #[arg(short, long)]
    listen: Option<String>,
    /// Token panels must present
    #[arg(long)]
    token: Option<String>,
    /// `SQLite` database path
    #[arg(long)]
    db: Option<PathBuf>,
    /// Root directory for instance working directories
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

/// Which runner a panel command talks to
#[derive(Args)]
struct TargetArgs {
    /// Runner id from the config file
    #[arg(long)]
    runner: Option<u64>,
    /// Runner control socket URL, or `host:port`
    #[arg(long, env = "LCSM_RUNNER_ENDPOINT")]
    endpoint: Option<String>,
    /// Runner auth token
    #[arg(long, env = "LCSM_RUNNER_TOKEN")]
    token: Option<String>,
    /// Seconds to wait for each response
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let development = std::env::var_os("LCSM_DEVELOPMENT").is_some();
    let filter = match (cli.verbose, development) {
        (0, false) => "info,lcsm_server=info",
        (0 | 1, _) => "info,lcsm_server=debug",
        (2, _) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or_else(|| Command::Runner(RunnerArgs::default())) {
        Command::Runner(args) => serve(args).await,
        Command::List {
            target,
            page,
            page_size,
        } => {
            let client = connect(&target).await?;
            let result = client.list_instances(PageQuery::new(page, page_size)).await;
            client.close().await;
            print_json(&result?)
        }
        Command::Add {
            target,
            name,
            launch_command,
            description,
            working_directory,
        } => {
            let client = connect(&target).await?;
            let new = NewInstance {
                name,
                description,
                launch_command,
                working_directory,
            };
            let result = client.add_instance(&new).await;
            client.close().await;
            print_json(&result?)
        }
        Command::Start { target, id } => {
            let client = connect(&target).await?;
            let result = client.start_instance(id).await;
            client.close().await;
            result?;
            println!("instance {id} started");
            Ok(())
        }
        Command::Stop { target, id } => {
            let client = connect(&target).await?;
            let result = client.stop_instance(id).await;
            client.close().await;
            result?;
            println!("instance {id} stopping");
            Ok(())
        }
        Command::Kill { target, id } => {
            let client = connect(&target).await?;
            let result = client.kill_instance(id).await;
            client.close().await;
            result?;
            println!("instance {id} killed");
            Ok(())
        }
        Command::Delete { target, id } => {
            let client = connect(&target).await?;
            let result = client.delete_instance(id).await;
            client.close().await;
            result?;
            println!("instance {id} deleted");
            Ok(())
        }
    }
}

/// Run the runner until Ctrl-C
async fn serve(args: RunnerArgs) -> anyhow::Result<()> {
    let config = RunnerConfig::load(RunnerSettings {
        listen_addr: args.listen,
        auth_token: args.token,
        db_path: args.db,
        data_dir: args.data_dir,
    })?;

    tracing::info!(
        listen = %config.listen_addr,
        db = %config.db_path.display(),
        data_dir = %config.data_dir.display(),
        "starting runner"
    );

    let runner = Runner::new(config)?;
    runner
        .run(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
        })
        .await?;

    Ok(())
}

/// Resolve the target runner into a client
async fn connect(target: &TargetArgs) -> anyhow::Result<Arc<RunnerClient>> {
    let panel = PanelConfig::load(target.timeout);

    if let Some(runner_id) = target.runner {
        let directory = StaticDirectory::from_entries(&panel.runners);
        let clients = RunnerClients::new(Arc::new(directory)).with_timeout(panel.call_timeout);
        return Ok(clients.get(runner_id).await?);
    }

    let (Some(endpoint), Some(token)) = (&target.endpoint, &target.token) else {
        anyhow::bail!("pass --runner ID or --endpoint URL --token TOKEN");
    };

    let client = RunnerClient::new(endpoint_url(endpoint)?, token.as_str())
        .with_timeout(panel.call_timeout);
    Ok(Arc::new(client))
}

/// Accept a bare `host:port` and point it at the control socket
fn endpoint_url(endpoint: &str) -> anyhow::Result<String> {
    if endpoint.starts_with("wss://") {
        anyhow::bail!("TLS runner endpoints are not supported, use ws://");
    }
    if endpoint.starts_with("ws://") {
        Ok(endpoint.to_string())
    } else {
        Ok(format!("ws://{endpoint}{CONTROL_SOCKET_PATH}"))
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address_points_at_control_socket() {
        assert_eq!(
            endpoint_url("10.0.0.5:8008").unwrap(),
            "ws://10.0.0.5:8008/lcsm-node.socket"
        );
        assert_eq!(
            endpoint_url("ws://runner:9000/lcsm-node.socket").unwrap(),
            "ws://runner:9000/lcsm-node.socket"
        );
    }

    #[test]
    fn tls_endpoint_is_rejected() {
        assert!(endpoint_url("wss://runner:8008/lcsm-node.socket").is_err());
    }
}
