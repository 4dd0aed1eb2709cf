//! ListKeeper CLI
//!
//! CLI tool for managing filter-list subscriptions and inspecting the files
//! the engine writes.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use env_logger::Env;

use lk_engine::EngineConfig;

mod records;
mod session;

#[derive(Parser)]
#[command(name = "lk-cli")]
#[command(about = "ListKeeper subscription manager and tools")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Engine config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the aggregate directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Treat the current network as metered
    #[arg(long, global = true)]
    metered: bool,

    /// Seconds to wait for downloads and rebuilds to settle
    #[arg(long, global = true, default_value_t = 60)]
    wait: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted
    Run,

    /// List subscriptions
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Enable a subscription by id
    Enable { id: String },

    /// Disable a subscription by id
    Disable { id: String },

    /// Add a custom list by url
    Add {
        url: String,

        #[arg(short, long)]
        title: Option<String>,
    },

    /// Remove a custom list by id
    Remove { id: String },

    /// Download every enabled list that was not fetched in the last minutes
    Update {
        /// Allow downloads on a metered network
        #[arg(long)]
        allow_metered: bool,
    },

    /// Exempt a website from blocking
    Allow { site: String },

    /// Remove a website from the allowlist
    Disallow { site: String },

    /// Compile filter list files into an aggregate without the engine
    Compile {
        /// Input filter list files
        #[arg(short, long, required = true)]
        input: Vec<String>,

        /// Output aggregate file
        #[arg(short, long, default_value = "aggregate.txt")]
        output: String,

        /// Websites to allowlist
        #[arg(short, long)]
        allow: Vec<String>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Dump a `.sub` or `.sub.meta` record
    Inspect {
        input: String,

        /// Print every filter
        #[arg(long)]
        filters: bool,
    },

    /// Show the aggregate the host should load
    Aggregate {
        /// Print its contents
        #[arg(long)]
        print: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile {
            input,
            output,
            allow,
            verbose,
        } => records::cmd_compile(&input, &output, &allow, verbose),
        Commands::Inspect { input, filters } => records::cmd_inspect(&input, filters),
        Commands::Aggregate { print } => {
            load_config(&cli.global).and_then(|config| records::cmd_aggregate(&config, print))
        }
        command => load_config(&cli.global).and_then(|config| run_session(command, config, &cli.global)),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(global: &GlobalArgs) -> Result<EngineConfig, String> {
    let mut config = match &global.config {
        Some(path) => EngineConfig::load(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &global.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(dir) = &global.cache_dir {
        config.cache_dir = dir.clone();
    }
    Ok(config)
}

fn run_session(command: Commands, config: EngineConfig, global: &GlobalArgs) -> Result<(), String> {
    let runtime = tokio::runtime::Runtime::new().map_err(|e| format!("Failed to start runtime: {}", e))?;
    let wait = Duration::from_secs(global.wait);
    let metered = global.metered;

    runtime.block_on(async move {
        let mut session = session::Session::start(config, metered)?;
        let result = match command {
            Commands::Run => session.cmd_run().await,
            Commands::List { json } => session.cmd_list(json),
            Commands::Enable { id } => session.cmd_change_state(&id, true, wait).await,
            Commands::Disable { id } => session.cmd_change_state(&id, false, wait).await,
            Commands::Add { url, title } => session.cmd_add(&url, title.as_deref(), wait).await,
            Commands::Remove { id } => session.cmd_remove(&id, wait).await,
            Commands::Update { allow_metered } => session.cmd_update(allow_metered, wait).await,
            Commands::Allow { site } => session.cmd_allowlist(&site, true, wait).await,
            Commands::Disallow { site } => session.cmd_allowlist(&site, false, wait).await,
            Commands::Compile { .. } | Commands::Inspect { .. } | Commands::Aggregate { .. } => Ok(()),
        };
        session.stop().await;
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_overrides() {
        let cli = Cli::parse_from(["lk-cli", "list", "--data-dir", "/tmp/lk", "--json"]);
        let config = load_config(&cli.global).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/lk"));
        assert!(matches!(cli.command, Commands::List { json: true }));
    }
}
