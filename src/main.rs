mod application;
mod domain;
mod infrastructure;

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use application::errors::BotError;
use application::messaging::CommandDispatcher;
use application::state::SharedState;
use domain::traits::ChatAdapter;
use infrastructure::adapters::console::ConsoleAdapter;
use infrastructure::config::{Config, PluginConfigManager};
use infrastructure::scheduler::TaskScheduler;
use infrastructure::scripts::metadata::HOST_VERSION;
use infrastructure::scripts::ScriptHost;
use infrastructure::storage::ExtensionStore;

#[derive(Parser)]
#[command(name = "tavern-bot", about = "Extensible tabletop RPG chat bot host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Write a default configuration file
    InitConfig {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Print host and scripting API versions
    Version,
}

fn install_panic_hook(dump_path: PathBuf) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let dump = format!(
            "{info}\n\n{}",
            std::backtrace::Backtrace::force_capture()
        );
        let _ = fs::write(&dump_path, dump);
        default_hook(info);
    }));
}

async fn run(config_path: PathBuf) -> Result<(), BotError> {
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        info!(
            "no config at {}, running with defaults",
            config_path.display()
        );
        Config::default()
    };
    fs::create_dir_all(&config.data_dir)
        .map_err(|e| BotError::Internal(format!("cannot create data dir: {e}")))?;
    install_panic_hook(config.data_dir.join("crash.txt"));

    let state = Arc::new(SharedState::new());
    let storage = Arc::new(ExtensionStore::open(config.storage_path())?);
    let scheduler = TaskScheduler::new();
    let configs = Arc::new(Mutex::new(PluginConfigManager::load(
        config.plugin_config_path(),
    )?));

    let scripts = Arc::new(ScriptHost::new(
        config.clone(),
        state.clone(),
        storage,
        scheduler.clone(),
        configs.clone(),
    )?);
    tokio::task::block_in_place(|| scripts.reload())?;

    tokio::spawn(scheduler.clone().run_loop());

    let dispatcher = Arc::new(
        CommandDispatcher::new(
            state,
            config.command_prefix.as_str(),
            config.max_execute_times,
        )
        .with_bot_id("console-bot"),
    );
    let adapter = ConsoleAdapter::new(config.bot_name.as_str(), dispatcher, scripts.clone());
    info!(
        "{} v{} is up, prefix '{}'",
        config.bot_name, *HOST_VERSION, config.command_prefix
    );

    tokio::select! {
        result = adapter.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    scripts.shutdown();
    configs
        .lock()
        .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?
        .save()?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::InitConfig { config } => {
            Config::default().save(&config).map_err(BotError::Config).map(|()| {
                println!("wrote default configuration to {}", config.display());
            })
        }
        Commands::Version => {
            println!("tavern-bot {} (scripting api {})", env!("CARGO_PKG_VERSION"), *HOST_VERSION);
            Ok(())
        }
    };
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
