use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod cli;

use cli::{Cli, Commands, ConfigCommands};
use warden_audit::AuditOrchestrator;
use warden_bridge::{
    launch_server, run_bridge_server, AuditCommands, BridgeError, BridgeResult, EventNotifier,
    PushSink, RpcClient, ServedBridge,
};
use warden_config::{BridgeConfig, ConfigLoader, WardenConfig};
use warden_execution::{
    run_worker, CommandSpawner, LocalSpawner, PluginRegistry, ProcessPool, WorkerSpawner,
};
use warden_ipc::StdioTransport;
use warden_logging::{init_logging_from_config, init_simple_tracing, init_worker_tracing};
use warden_messaging::Dispatcher;

/// Load configuration from a file, falling back to environment and defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<WardenConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                info!("Loading configuration from: {:?}", path);
                loader
                    .from_file(path)
                    .with_context(|| format!("Failed to load configuration from {:?}", path))
            } else {
                warn!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => {
            debug!("No configuration file specified. Loading from environment or defaults.");
            loader
                .from_env()
                .context("Failed to load configuration from environment")
        }
    }
}

/// Serve plugin calls for the coordinator over stdin/stdout
async fn run_worker_process(worker_id: String) -> Result<()> {
    let registry = Arc::new(PluginRegistry::with_builtins());
    run_worker(worker_id, StdioTransport::stdio(), registry)
        .await
        .context("Worker process failed")
}

/// Run the bridge server child over stdin/stdout
async fn run_bridge_server_process(config: BridgeConfig) -> Result<()> {
    run_bridge_server(
        &config,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
    .context("Bridge server failed")
}

/// Start the Warden service and run until asked to stop
async fn serve_command(config: WardenConfig) -> Result<()> {
    info!("Starting Warden service");

    let registry = Arc::new(PluginRegistry::with_builtins());
    let spawner: Arc<dyn WorkerSpawner> = if config.process_pool.is_in_process() {
        info!("Running plugins in-process");
        Arc::new(LocalSpawner::new(Arc::clone(&registry)))
    } else {
        Arc::new(CommandSpawner::from_config(&config.process_pool)?)
    };
    let pool = ProcessPool::new(config.process_pool.clone(), Arc::clone(&registry), spawner);
    let dispatcher = Arc::new(Dispatcher::new());
    let orchestrator =
        AuditOrchestrator::new(Arc::clone(&dispatcher), pool.clone(), config.audit.clone());

    let commands = AuditCommands::new(orchestrator.clone()).with_config(config.to_json()?);
    let stop_requested = commands.shutdown_signal();

    let mut bridge = if config.bridge.enabled {
        let link = launch_server(&config.bridge)
            .await
            .context("Failed to start the bridge server")?;
        let served = link.serve(Arc::new(commands.clone()));
        dispatcher.add_listener(Arc::new(EventNotifier::new(served.outbox())));
        info!(
            "RPC endpoint available at http://{}{}",
            served.addr(),
            config.bridge.rpc_path
        );
        Some(served)
    } else {
        if let Some(url) = &config.bridge.push_url {
            let sink = PushSink::new(url, config.bridge.push_timeout)
                .context("Invalid push URL")?;
            dispatcher.add_listener(Arc::new(sink));
            info!(%url, "Pushing audit events");
        }
        None
    };

    info!(plugins = registry.len(), "Warden service ready");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
        _ = stop_requested.notified() => {
            info!("Stop requested over the bridge");
        }
        outcome = bridge_finished(&mut bridge) => match outcome {
            Ok(()) => warn!("Bridge server went away"),
            Err(e) => error!("Bridge server failed: {}", e),
        },
    }

    info!("Shutting down Warden service");
    orchestrator.stop_all();
    if let Some(bridge) = bridge {
        bridge.shutdown().await;
    }
    pool.stop().await;

    let stats = pool.stats();
    info!(
        calls = stats.calls_completed,
        failed = stats.calls_failed,
        workers_spawned = stats.workers_spawned,
        "Warden service stopped"
    );
    Ok(())
}

async fn bridge_finished(bridge: &mut Option<ServedBridge>) -> BridgeResult<()> {
    match bridge {
        Some(bridge) => bridge.finished().await,
        None => std::future::pending().await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Issue one RPC call and print its result
async fn call_command(
    bridge: &BridgeConfig,
    command: &str,
    args: &[String],
    url: Option<&str>,
) -> Result<()> {
    let url = match url {
        Some(url) => url.to_string(),
        None => default_rpc_url(bridge),
    };
    let client = RpcClient::new(&url)?;
    let args = args.iter().map(|arg| parse_arg(arg)).collect();

    debug!(%url, %command, "Calling RPC endpoint");
    match client.call(command, args).await {
        Ok(result) => {
            let formatted =
                serde_json::to_string_pretty(&result).context("Failed to format result as JSON")?;
            println!("{}", formatted);
            Ok(())
        }
        Err(BridgeError::Remote(e)) => Err(anyhow::anyhow!("{} failed: {}", command, e)),
        Err(e) => Err(e).with_context(|| format!("Failed to call {}", url)),
    }
}

fn default_rpc_url(bridge: &BridgeConfig) -> String {
    let host = match bridge.listen_address.as_str() {
        "0.0.0.0" => "127.0.0.1",
        "::" => "[::1]",
        other => other,
    };
    format!("http://{}:{}{}", host, bridge.listen_port, bridge.rpc_path)
}

fn parse_arg(arg: &str) -> JsonValue {
    serde_json::from_str(arg).unwrap_or_else(|_| JsonValue::String(arg.to_string()))
}

/// Handle configuration validation
fn handle_config_validate(config_file: &Path) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found: {:?}",
            config_file
        ));
    }

    match ConfigLoader::new().from_file(config_file) {
        Ok(_config) => {
            println!("Configuration file is valid");
            Ok(())
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            Err(anyhow::Error::new(e)
                .context(format!("Invalid configuration in {:?}", config_file)))
        }
    }
}

/// Handle configuration generation
fn handle_config_generate(output: Option<&Path>, force: bool) -> Result<()> {
    let content = WardenConfig::generate_sample();

    let Some(output) = output else {
        print!("{}", content);
        return Ok(());
    };

    if output.exists() && !force {
        return Err(anyhow::anyhow!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        ));
    }

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).context("Failed to create output directory")?;
        }
    }

    fs::write(output, content)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;
    println!("Configuration written to {:?}", output);
    Ok(())
}

fn handle_config_show(config: &WardenConfig) -> Result<()> {
    let formatted = serde_json::to_string_pretty(&config.to_json()?)
        .context("Failed to format configuration as JSON")?;
    println!("{}", formatted);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Internal modes speak a protocol on stdout, so they log to stderr only
    if cli.worker {
        let worker_id = cli.worker_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        init_worker_tracing(cli.log_level.as_deref())?;
        return run_worker_process(worker_id).await;
    }

    if cli.bridge_server {
        init_worker_tracing(cli.log_level.as_deref())?;
        let config = match &cli.bridge_config {
            Some(encoded) => serde_json::from_str::<BridgeConfig>(encoded)
                .context("Invalid --bridge-config")?,
            None => load_config(cli.config.as_ref())?.bridge,
        };
        return run_bridge_server_process(config).await;
    }

    match &cli.command {
        Some(Commands::Serve) => {
            let config = load_config(cli.config.as_ref())?;
            let _guard = match &cli.log_level {
                Some(level) => {
                    init_simple_tracing(level)?;
                    None
                }
                None => Some(init_logging_from_config(&config.logging)?),
            };
            serve_command(config).await
        }
        Some(Commands::Call { command, args, url }) => {
            init_worker_tracing(Some(cli.log_level.as_deref().unwrap_or("warn")))?;
            let config = load_config(cli.config.as_ref())?;
            call_command(&config.bridge, command, args, url.as_deref()).await
        }
        Some(Commands::Config { config_cmd }) => {
            init_worker_tracing(Some(cli.log_level.as_deref().unwrap_or("warn")))?;
            match config_cmd {
                ConfigCommands::Validate { config_file } => handle_config_validate(config_file),
                ConfigCommands::Generate { output, force } => {
                    handle_config_generate(output.as_deref(), *force)
                }
                ConfigCommands::Show => handle_config_show(&load_config(cli.config.as_ref())?),
            }
        }
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}
