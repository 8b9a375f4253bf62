//! sumtune CLI: fine-tune, evaluate and export summarization models.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use sumtune_ml::{ModelReference, ModelSelection};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// sumtune: model-family-aware summarization fine-tuning
#[derive(Parser, Debug)]
#[command(name = "sumtune", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path, merged over the workspace config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Dataset overrides shared by the data-consuming commands.
#[derive(clap::Args, Debug, Default)]
struct DatasetArgs {
    /// Cap on training examples
    #[arg(long)]
    max_train: Option<usize>,

    /// Cap on validation examples
    #[arg(long)]
    max_test: Option<usize>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Show the reference, family and loading policy of model selections
    Resolve {
        /// Selection to show (all when omitted)
        selection: Option<ModelSelection>,
    },
    /// Load and format the dataset without training
    Prepare {
        /// Model selection whose tokenizer and format to use
        #[arg(short, long)]
        selection: Option<ModelSelection>,
        #[command(flatten)]
        dataset: DatasetArgs,
        /// Write the prepared splits as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fine-tune, store, evaluate and optionally export
    Run {
        #[arg(short, long)]
        selection: Option<ModelSelection>,
        #[command(flatten)]
        dataset: DatasetArgs,
        /// Push the trained model here (owner/repo)
        #[arg(short, long)]
        export: Option<ModelReference>,
        /// Write the run summary as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Evaluate a stored model on the configured validation split
    Evaluate {
        /// Path to a stored trained_model.json
        manifest: PathBuf,
        #[command(flatten)]
        dataset: DatasetArgs,
    },
    /// Push a stored model to a model repository
    Export {
        /// Path to a stored trained_model.json
        manifest: PathBuf,
        /// Destination (owner/repo)
        destination: ModelReference,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default .sumtune/config.toml into the workspace
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // HF_TOKEN and SUMTUNE_* usually come from .env
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "sumtune", "sumtune")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "sumtune.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "sumtune",
            "-v",
            "run",
            "--selection",
            "gpt_j_6b",
            "--max-train",
            "900",
            "--max-test",
            "100",
            "--export",
            "acme/sum-model",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run {
                selection,
                dataset,
                export,
                output,
            } => {
                assert_eq!(selection, Some(ModelSelection::GptJ6b));
                assert_eq!(dataset.max_train, Some(900));
                assert_eq!(dataset.max_test, Some(100));
                assert_eq!(export, Some(ModelReference::new("acme", "sum-model")));
                assert!(output.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_unknown_selection_rejected() {
        assert!(Cli::try_parse_from(["sumtune", "resolve", "flan_huge"]).is_err());
    }
}
