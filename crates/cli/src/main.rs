//! mailwatch - sync mail folders as soon as they change

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use mailwatch_cli::logging;
use mailwatch_core::config::LogConfig;

mod cmd;

/// mailwatch - run your mail sync command whenever a maildir folder changes
#[derive(Parser)]
#[command(name = "mailwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/mail/mailwatch.toml)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Raise the log level, repeat for more
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch all accounts and sync changed folders until interrupted
    Run,
    /// Validate the configuration and show what would be watched
    Check,
    /// Show which folder a path belongs to, or why it is ignored
    Resolve {
        /// Paths below an account root
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Treat paths that do not exist as directories
        #[arg(long)]
        dir: bool,
    },
    /// Run the sync command once in the foreground
    Sync {
        /// Account name
        account: String,
        /// Folder to sync (default: the whole account)
        folder: Option<String>,
    },
    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the configuration file path
    Path,
    /// Print an annotated example configuration
    Example,
    /// Create the configuration file from the example if it is missing
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    // The daemon configures logging from its config file
    let _guard = match cli.command {
        Commands::Run => None,
        _ => logging::init(
            &LogConfig {
                level: "warn".to_string(),
                file: None,
            },
            cli.verbose,
        )?,
    };

    match cli.command {
        Commands::Run => cmd::run::run(config_path, cli.verbose).await,
        Commands::Check => cmd::check::run(config_path).await,
        Commands::Resolve { paths, dir } => cmd::resolve::run(config_path, &paths, dir).await,
        Commands::Sync { account, folder } => {
            cmd::sync::run(config_path, &account, folder.as_deref()).await
        }
        Commands::Config(config_cmd) => match config_cmd {
            ConfigCommands::Path => cmd::config::run_path(config_path).await,
            ConfigCommands::Example => cmd::config::run_example().await,
            ConfigCommands::Init => cmd::config::run_init(config_path).await,
        },
    }
}
