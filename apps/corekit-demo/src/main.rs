use anyhow::Result;
use clap::{Parser, Subcommand};
use corekit::{Core, TokioScheduler};
use corekit_bootstrap::{AppConfig, AppConfigProvider, CliArgs, ConfigProvider};
use serde_json::Value;

use std::path::PathBuf;
use std::sync::Arc;

mod chat;

/// Corekit demo - a chat room built from corekit modules
#[derive(Parser)]
#[command(name = "corekit-demo")]
#[command(about = "Corekit demo - a chat room built from corekit modules")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable debug mode (module errors propagate instead of being logged)
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat script
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
        debug: cli.debug,
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (COREKIT__*) -> 4) CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.as_ref().cloned().unwrap_or_default();
    corekit_bootstrap::logging::init_logging(&logging_config, &config.core.home_path());

    tracing::info!(debug_mode = config.core.debug_mode, "Corekit demo starting");

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_chat(config).await,
        Commands::Check => check_config(config),
    }
}

async fn run_chat(config: AppConfig) -> Result<()> {
    let provider = AppConfigProvider::new(config);
    let core = Core::with_debug_mode(provider.inner().core.debug_mode);

    let scheduler = Arc::new(TokioScheduler::new());
    mediator::install(&core, scheduler.clone())?;
    let transcript = chat::install(&core)?;

    let app_data = provider
        .get_module_config("app")
        .cloned()
        .unwrap_or(Value::Null);
    let script = chat::script_from(&app_data)?;

    let registry = core.registry();
    registry.start("app", app_data)?;
    scheduler.run_until_idle().await;

    let conversation = async {
        for step in &script {
            if let Err(e) = chat::apply(registry, step) {
                tracing::warn!(error = %e, ?step, "Script step failed");
            }
            scheduler.run_until_idle().await;
        }
    };

    tokio::select! {
        _ = conversation => tracing::info!(steps = script.len(), "Script finished"),
        res = corekit_bootstrap::wait_for_shutdown() => res?,
    }

    registry.destroy_all(None)?;
    scheduler.run_until_idle().await;
    scheduler.shutdown().await;

    for line in transcript.lines() {
        println!("{line}");
    }
    tracing::info!("Corekit demo stopped");
    Ok(())
}

fn check_config(config: AppConfig) -> Result<()> {
    tracing::info!("Checking configuration…");
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);

    let core = Core::with_debug_mode(config.core.debug_mode);
    let scheduler = Arc::new(corekit::TickQueue::new());
    mediator::install(&core, scheduler)?;
    chat::install(&core)?;
    for module in core.registry().get_modules() {
        let parent = module
            .super_name
            .map(|parent| format!(" (inherits {parent})"))
            .unwrap_or_default();
        println!("module {}{parent} tools={:?}", module.name, module.tool_names);
    }
    Ok(())
}
