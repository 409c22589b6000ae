mod cli;

use aihub::api::{self, AppState};
use aihub::capability::{CapabilityRegistry, InMemoryCapabilityRegistry};
use aihub::config::Config;
use aihub::plugin::package;
use aihub::plugin::{
    DefaultRuntimeFactory, FsPackageStore, OperationContext, PluginManager, PluginRecord,
    PluginRegistry, SqlitePluginRegistry, SystemInitializer,
};
use aihub::utils::paths::{ensure_aihub_dir_exists, get_logs_dir};
use aihub_plugin_interface::{CapabilityType, PluginType};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use cli::{Cli, Commands, PluginCommand};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Daily-rolling writer for ~/.aihub/logs/aihub.log.
fn log_file_writer() -> Option<(
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
)> {
    let logs_dir = get_logs_dir().ok()?;

    if let Err(e) = fs::create_dir_all(&logs_dir) {
        eprintln!("Warning: Could not create logs directory: {}", e);
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(&logs_dir, "aihub.log");
    Some(tracing_appender::non_blocking(file_appender))
}

/// Initialize file-only logging for one-shot CLI commands so log lines never
/// mix with command output.
///
/// Log level can be controlled with RUST_LOG env var (default: info).
fn init_file_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (non_blocking, guard) = log_file_writer()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Some(guard)
}

/// Server logs go to stdout and to the log file.
fn init_server_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let (file_layer, guard) = match log_file_writer() {
        Some((writer, guard)) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            ),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

/// Wire the registry, capability index, package store and runtime factory
/// into a manager.
fn build_manager(config: &Config) -> Result<Arc<PluginManager>> {
    ensure_aihub_dir_exists()?;

    let db_path = config.database_path()?;
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let registry: Arc<dyn PluginRegistry> = Arc::new(
        SqlitePluginRegistry::open(&db_path)
            .with_context(|| format!("Failed to open plugin registry at {:?}", db_path))?,
    );
    let capabilities: Arc<dyn CapabilityRegistry> = Arc::new(InMemoryCapabilityRegistry::new(
        Arc::clone(&registry),
        config.plugins.event_buffer,
    ));
    let packages = Arc::new(
        FsPackageStore::new(config.packages_dir()?)
            .with_max_unpacked_bytes(config.plugins.max_package_bytes),
    );
    let runtimes = Arc::new(DefaultRuntimeFactory::new(Duration::from_secs(
        config.plugins.max_invoke_timeout_secs,
    )));

    Ok(Arc::new(PluginManager::new(
        registry,
        capabilities,
        packages,
        runtimes,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Some(Commands::Serve { port }) => run_server(&config, port).await,
        None => run_server(&config, None).await,
        Some(command) => {
            let _log_guard = init_file_logging();
            let manager = build_manager(&config)?;
            // Rebuild the index only; recovery is left to the server so a CLI
            // call never settles an operation the server still has in flight.
            manager.refresh_capabilities().await?;
            let result = run_command(&manager, command).await;
            manager.shutdown().await;
            result
        }
    }
}

async fn run_server(config: &Config, port: Option<u16>) -> Result<()> {
    // Guard must be kept alive for the duration of the server
    let _log_guard = init_server_logging();

    let manager = build_manager(config)?;
    let report = SystemInitializer::new(Arc::clone(&manager), config.plugins.auto_load)
        .run()
        .await?;
    for (plugin_id, reason) in &report.failed {
        tracing::warn!(plugin = %plugin_id, error = %reason, "Plugin left FAILED after startup");
    }

    // CLI commands write the same store through their own manager.
    let reconciler = match config.plugins.reconcile_interval_secs {
        0 => None,
        secs => Some(spawn_reconciler(Arc::clone(&manager), Duration::from_secs(secs))),
    };

    let app = api::create_router(AppState::new(Arc::clone(&manager)));
    let addr = format!("0.0.0.0:{}", port.unwrap_or(config.server.port));

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped, deactivating plugins");
    if let Some(task) = reconciler {
        task.abort();
    }
    manager.shutdown().await;
    Ok(())
}

fn spawn_reconciler(manager: Arc<PluginManager>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already refreshed.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = manager.reconcile().await {
                tracing::warn!(error = %e, "Plugin reconcile failed");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

async fn run_command(manager: &PluginManager, command: Commands) -> Result<()> {
    match command {
        Commands::Plugin { command } => handle_plugin_command(manager, command).await,
        Commands::Capabilities { kind } => {
            let capabilities = manager.capabilities();
            let entries = match kind {
                Some(raw) => capabilities.get_by_type(raw.parse::<CapabilityType>()?),
                None => capabilities.get_all(),
            };

            if entries.is_empty() {
                println!("No capabilities registered.");
                return Ok(());
            }

            println!("{:<28} {:<14} {:<24} AVAILABLE", "NAME", "TYPE", "PLUGIN");
            println!("{}", "-".repeat(76));
            for entry in entries {
                println!(
                    "{:<28} {:<14} {:<24} {}",
                    entry.name,
                    entry.kind,
                    entry.plugin_id,
                    if entry.available { "yes" } else { "no" }
                );
            }
            Ok(())
        }
        Commands::Invoke { capability, input } => {
            let input: serde_json::Value =
                serde_json::from_str(&input).context("Input must be valid JSON")?;
            let output = manager.invoke(&capability, input).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Commands::Serve { .. } => Err(anyhow!("serve is not a one-shot command")),
    }
}

async fn handle_plugin_command(manager: &PluginManager, command: PluginCommand) -> Result<()> {
    let ctx = OperationContext::new(cli_actor());

    match command {
        PluginCommand::List { plugin_type } => {
            let mut plugins = match plugin_type {
                Some(raw) => manager.get_plugins_by_type(raw.parse::<PluginType>()?)?,
                None => manager.list_plugins()?,
            };
            plugins.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));

            if plugins.is_empty() {
                println!("No plugins installed.");
                println!("\nInstall plugins with: aihub plugin install <path-or-url>");
                return Ok(());
            }

            println!(
                "{:<24} {:<10} {:<20} {:<12} NAME",
                "ID", "VERSION", "TYPE", "STATE"
            );
            println!("{}", "-".repeat(80));
            for record in plugins {
                println!(
                    "{:<24} {:<10} {:<20} {:<12} {}",
                    record.plugin_id, record.version, record.plugin_type, record.state, record.name
                );
            }
            Ok(())
        }
        PluginCommand::Info { id, locale } => {
            let record = manager.get_plugin(&id)?;
            print_plugin(&record, locale.as_deref());
            Ok(())
        }
        PluginCommand::Install { locator } => {
            let package = package::fetch(&locator).await?;
            let record = manager.install_plugin(&package, &ctx).await?;
            println!(
                "\x1b[32m[OK]\x1b[0m Installed plugin '{}' v{} ({})",
                record.plugin_id, record.version, record.state
            );
            println!("Enable it with: aihub plugin enable {}", record.plugin_id);
            Ok(())
        }
        PluginCommand::Update { id, locator } => {
            let package = package::fetch(&locator).await?;
            let record = manager.update_plugin(&id, &package, &ctx).await?;
            println!(
                "\x1b[32m[OK]\x1b[0m Updated plugin '{}' to v{} ({})",
                record.plugin_id, record.version, record.state
            );
            Ok(())
        }
        PluginCommand::Enable { id } => {
            let record = manager.enable_plugin(&id).await?;
            println!(
                "\x1b[32m[OK]\x1b[0m Enabled plugin '{}' ({} capabilities)",
                record.plugin_id,
                record.capabilities.len()
            );
            Ok(())
        }
        PluginCommand::Disable { id } => {
            manager.disable_plugin(&id).await?;
            println!("\x1b[32m[OK]\x1b[0m Disabled plugin '{}'", id);
            Ok(())
        }
        PluginCommand::Uninstall { id } => {
            manager.uninstall_plugin(&id).await?;
            println!("\x1b[32m[OK]\x1b[0m Uninstalled plugin '{}'", id);
            Ok(())
        }
    }
}

fn cli_actor() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .map(|u| format!("cli:{}", u))
        .unwrap_or_else(|| "cli".to_string())
}

fn print_plugin(record: &PluginRecord, locale: Option<&str>) {
    println!("{} ({})", record.name, record.plugin_id);
    println!("  Version:      {}", record.version);
    println!("  Type:         {}", record.plugin_type);
    println!("  State:        {}", record.state);
    if let Some(author) = &record.author {
        println!("  Author:       {}", author);
    }
    let locale = locale.unwrap_or(aihub::plugin::descriptor::FALLBACK_LOCALE);
    if let Some(description) = record.description(locale) {
        println!("  Description:  {}", description);
    }
    println!("  Source:       {}", record.source_reference);
    println!("  Installed by: {}", record.created_by);
    if let Some(error) = &record.last_error {
        println!("  Last error:   {}", error);
    }
    println!("  Capabilities:");
    for capability in &record.capabilities {
        println!("    - {} [{}]", capability.name, capability.kind);
    }
}
