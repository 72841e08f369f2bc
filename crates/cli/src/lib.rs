mod clear;
mod index;
pub mod project;
mod refs;
pub mod resolver;
pub mod session;
mod stats;
pub mod watch;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::session::SessionOptions;

#[derive(Parser)]
#[command(
    name = "refscope",
    version,
    about = "An incremental file reference graph for narrowing search scope",
    long_about = "Refscope records which files refer to which other files and keeps that graph \
                  up to date as the project changes. Asking who refers to a file returns a small \
                  candidate set instead of the whole project."
)]
pub struct Cli {
    /// JSON file with engine settings
    #[arg(long, global = true, value_name = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Treat declared supertypes (`extends`/`implements`) as references too
    #[arg(long, global = true)]
    pub supertypes: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Index a project directory into a reference graph
    #[command(
        long_about = "Scans the project, resolves every new or changed file and persists the graph. \
                            By default, the index is stored in ~/.refscope/indices/."
    )]
    Index {
        /// Path to the project root directory to index
        #[arg(value_name = "PROJECT_PATH")]
        path: PathBuf,
    },
    /// List the files that refer to a file
    #[command(
        long_about = "Brings the index up to date, then prints every file that refers to FILE. \
                            FILE may be absolute or relative to the project root."
    )]
    Refs {
        /// Path to the project root directory
        #[arg(value_name = "PROJECT_PATH")]
        path: PathBuf,
        /// File whose referrers are listed
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Watch for file changes and update the index automatically
    #[command(
        long_about = "Starts a file watcher that monitors the project directory for changes. \
                            Changed files are re-resolved in the background until Ctrl+C."
    )]
    Watch {
        /// Path to the project root directory to watch
        #[arg(value_name = "PROJECT_PATH")]
        path: PathBuf,
    },
    /// Show index statistics
    Stats {
        /// Path to the project root directory
        #[arg(value_name = "PROJECT_PATH")]
        path: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear built indices
    #[command(
        long_about = "Removes built index files. If a path is provided, only that project's index \
                            is removed. Otherwise, all indices are cleared."
    )]
    Clear {
        /// Path to the project root directory to clear (optional)
        #[arg(value_name = "PROJECT_PATH")]
        path: Option<PathBuf>,
    },
}

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Table and JSON output go to stdout, so logs stay on stderr and in the log file.
    let _guard = refscope_core::logging::init_logging("cli", true);

    let options = SessionOptions {
        config: cli.config,
        supertypes: cli.supertypes,
    };

    match cli.command {
        Commands::Index { path } => index::run(path, options),
        Commands::Refs { path, file } => refs::run(path, file, options),
        Commands::Watch { path } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(watch::run(path, options))
        }
        Commands::Stats { path, json } => stats::run(path, json, options),
        Commands::Clear { path } => clear::run(path),
    }
}
