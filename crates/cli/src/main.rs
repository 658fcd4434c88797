use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use toolmux_mcp::config::{default_config_path, load_config_from_path};
use toolmux_mcp::{ClientManager, ServerConfig, ToolCallResult};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "toolmux", version, about = "Drive a set of MCP servers from the command line")]
struct Cli {
    /// Server configuration file. Defaults to $TOOLMUX_CONFIG or the user config directory.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every routable tool by qualified name
    Tools,
    /// Invoke a tool
    Call {
        /// Qualified tool name, e.g. mcp_fs_read_file
        name: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// List resources announced by connected servers
    Resources,
    /// Read a resource by uri
    Read {
        uri: String,
        /// Ask this server instead of the uri's owner
        #[arg(long)]
        server: Option<String>,
    },
    /// List prompt templates by qualified name
    Prompts,
    /// Render a prompt template
    Prompt {
        /// Qualified prompt name, or the server's own name together with --server
        name: String,
        /// Template arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        #[arg(long)]
        server: Option<String>,
    },
    /// Show connection state per server
    Status,
    /// Print call and connection statistics as JSON
    Stats,
    /// Run the heartbeat and print lifecycle events until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config_from_path(&path).with_context(|| format!("failed to load {}", path.display()))?;
    let manager = ClientManager::new(config.settings.clone());
    register_servers(&manager, config.servers()).await;

    let outcome = run(&manager, cli.command).await;
    manager.shutdown().await;
    outcome
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Connect all servers concurrently; failures are logged by the manager.
async fn register_servers(manager: &ClientManager, servers: Vec<ServerConfig>) {
    let mut pending = JoinSet::new();
    for server in servers {
        let manager = manager.clone();
        pending.spawn(async move { manager.add_server(server).await });
    }
    while let Some(joined) = pending.join_next().await {
        if let Err(error) = joined {
            warn!("server registration task failed: {error}");
        }
    }
}

async fn run(manager: &ClientManager, command: Command) -> Result<()> {
    match command {
        Command::Tools => {
            for (name, route) in manager.all_tools().await {
                println!("{name}\t{}", route.tool.description);
            }
        }
        Command::Call { name, args } => {
            let arguments: Value = serde_json::from_str(&args).context("--args must be valid JSON")?;
            print_result(manager.call_tool(&name, arguments).await)?;
        }
        Command::Resources => {
            for (uri, route) in manager.all_resources().await {
                let mime = route.resource.mime_type.as_deref().unwrap_or("-");
                println!("{uri}\t{}\t{mime}\t{}", route.server, route.resource.description);
            }
        }
        Command::Read { uri, server } => {
            print_result(manager.read_resource(&uri, server.as_deref()).await)?;
        }
        Command::Prompts => {
            for (name, route) in manager.all_prompts().await {
                let arguments: Vec<_> = route
                    .prompt
                    .arguments
                    .iter()
                    .map(|argument| if argument.required { format!("{}*", argument.name) } else { argument.name.clone() })
                    .collect();
                println!("{name}({})\t{}", arguments.join(", "), route.prompt.description);
            }
        }
        Command::Prompt { name, args, server } => {
            let arguments: Value = serde_json::from_str(&args).context("--args must be valid JSON")?;
            print_result(manager.get_prompt(&name, arguments, server.as_deref()).await)?;
        }
        Command::Status => {
            let status = manager.get_status().await;
            for (name, server) in &status.servers {
                println!(
                    "{} {name:<20} {:<12} {:<5} {} tools, {} resources, {} prompts",
                    server.state.icon(),
                    server.state.display(),
                    server.transport,
                    server.tools_count,
                    server.resources_count,
                    server.prompts_count
                );
            }
            println!(
                "{}/{} connected, {} tools",
                status.connected_servers, status.total_servers, status.total_tools
            );
        }
        Command::Stats => {
            let stats = manager.get_all_stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Watch => watch(manager).await?,
    }
    Ok(())
}

fn print_result(result: ToolCallResult) -> Result<()> {
    if !result.success {
        bail!(
            "{} (after {} attempt(s), {:.0} ms)",
            result.error_message().unwrap_or_default(),
            result.attempts,
            result.duration_ms()
        );
    }
    println!("{}", result.content.unwrap_or_default());
    Ok(())
}

async fn watch(manager: &ClientManager) -> Result<()> {
    let mut events = manager.subscribe();
    if !manager.start_heartbeat().await {
        warn!("heartbeat is disabled; only explicit events will be shown");
    }
    info!("watching {} server(s), press Ctrl-C to stop", manager.get_status().await.total_servers);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!("dropped {skipped} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}
