mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use polyglot_engine::backend::js_worker;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "polyglot-cli")]
#[command(about = "Polyglot CLI - Run code locally and manage language configuration", long_about = None)]
struct Cli {
    /// Path to the language configuration file
    #[arg(long, global = true, default_value = "config/languages.json")]
    config: PathBuf,

    /// Show engine logs on stderr
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a snippet through the execution engine
    Run {
        /// Language name (e.g., python, javascript, c)
        #[arg(short, long)]
        language: String,

        /// Read code from this file
        #[arg(short, long, conflicts_with = "code")]
        file: Option<PathBuf>,

        /// Code given inline
        #[arg(short, long)]
        code: Option<String>,

        /// Wall-clock budget in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// List configured languages and whether their toolchains are installed
    Languages,

    /// Write the built-in language configuration
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing config/languages.json
        #[arg(long, default_value = "false")]
        force: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    // Runs of JavaScript re-execute this binary as their worker
    if let Some(code) = js_worker::run_if_requested() {
        std::process::exit(code);
    }
    run()
}

#[tokio::main]
async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            language,
            file,
            code,
            timeout_ms,
        } => {
            let succeeded =
                commands::run_code(&cli.config, &language, file.as_deref(), code, timeout_ms)
                    .await?;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Commands::Languages => {
            commands::list_languages(&cli.config)?;
        }
        Commands::Init { path, force } => {
            commands::init_project(&path, force)?;
        }
    }

    Ok(())
}
