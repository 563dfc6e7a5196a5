mod commands;

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "composed")]
#[command(about = "Run a set of services as one supervised unit")]
struct Args {
    /// Log level (error, warn, info, debug, trace); overrides LogLevel=
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every service and supervise them until shutdown
    Run {
        /// Path to the composition file
        path: PathBuf,
    },

    /// Validate a composition file and show the start order
    Check {
        /// Path to the composition file
        path: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    let log_level = args.log_level.as_deref();

    let result = match &args.command {
        Command::Run { path } => commands::run(path, log_level).await,
        Command::Check { path } => commands::check(path, log_level).await.map(|()| 0),
    };

    let code = result.unwrap_or_else(|e| {
        eprintln!("composed: {}", e);
        1
    });

    let _ = std::io::stdout().flush();
    std::process::exit(code);
}
