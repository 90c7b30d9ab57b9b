mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "fluxion",
    version,
    about = "Streaming document pipelines over JSON records"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline file until its source is exhausted or Ctrl-C
    Run {
        /// Path to pipeline YAML or JSON file
        pipeline: PathBuf,
    },
    /// Apply a pipeline's stages to inline documents and print the result
    Eval {
        /// Path to pipeline YAML or JSON file
        pipeline: PathBuf,
        /// One JSON document or a JSON array of documents
        #[arg(long)]
        input: String,
    },
    /// Validate a pipeline file and probe its source
    Check {
        /// Path to pipeline YAML or JSON file
        pipeline: PathBuf,
    },
    /// List built-in connectors and their options
    Connectors {
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run { pipeline } => commands::run::execute(&pipeline).await,
        Commands::Eval { pipeline, input } => commands::eval::execute(&pipeline, &input).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline),
        Commands::Connectors { json } => commands::connectors::execute(json),
    }
}
