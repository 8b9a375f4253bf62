//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use std::path::{Path, PathBuf};
use sumtune_ml::config::{PipelineConfig, load_config};
use sumtune_ml::backend::worker::install_worker_script;
use sumtune_ml::storage::atomic_write;
use sumtune_ml::{FsModelStore, ModelReference, ModelSelection, Pipeline};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    if let Commands::Config { action } = command {
        return handle_config(action, workspace, config_file);
    }

    let overrides = command_overrides(&command);
    let config = load_config(Some(workspace), config_file, Some(&overrides))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    match command {
        Commands::Resolve { selection } => handle_resolve(selection, &config, workspace),
        Commands::Prepare { output, .. } => handle_prepare(&config, workspace, output).await,
        Commands::Run { output, .. } => handle_run(&config, workspace, output).await,
        Commands::Evaluate { manifest, .. } => {
            handle_evaluate(&config, workspace, &manifest).await
        }
        Commands::Export {
            manifest,
            destination,
        } => handle_export(&config, workspace, &manifest, &destination).await,
        Commands::Config { .. } => Ok(()),
    }
}

/// Sparse configuration table holding only the flags the user passed.
fn command_overrides(command: &Commands) -> serde_json::Value {
    let mut training = serde_json::Map::new();
    let mut dataset = serde_json::Map::new();
    let mut root = serde_json::Map::new();

    let (selection, args, export) = match command {
        Commands::Prepare {
            selection, dataset, ..
        } => (*selection, Some(dataset), None),
        Commands::Run {
            selection,
            dataset,
            export,
            ..
        } => (*selection, Some(dataset), export.as_ref()),
        Commands::Evaluate { dataset, .. } => (None, Some(dataset), None),
        _ => (None, None, None),
    };

    if let Some(selection) = selection {
        training.insert("model_selection".into(), selection.as_str().into());
    }
    if let Some(args) = args {
        if let Some(n) = args.max_train {
            dataset.insert("max_train_samples".into(), n.into());
        }
        if let Some(n) = args.max_test {
            dataset.insert("max_test_samples".into(), n.into());
        }
    }
    if let Some(export) = export {
        root.insert("export".into(), export.to_string().into());
    }
    if !training.is_empty() {
        root.insert("training".into(), training.into());
    }
    if !dataset.is_empty() {
        root.insert("dataset".into(), dataset.into());
    }
    serde_json::Value::Object(root)
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".sumtune");
            std::fs::create_dir_all(&config_dir)?;

            let worker_path = config_dir.join("worker.py");
            if install_worker_script(&worker_path)? {
                println!("Installed model worker at: {}", worker_path.display());
            }

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&PipelineConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), config_file, None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn handle_resolve(
    selection: Option<ModelSelection>,
    config: &PipelineConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config, workspace)?;
    let selections = match selection {
        Some(selection) => vec![selection],
        None => ModelSelection::ALL.to_vec(),
    };

    for selection in selections {
        let resolved = pipeline.resolve(selection)?;
        let properties = pipeline.registry().properties(resolved.family)?;
        println!(
            "{:<20} {:<28} {:<11} quantized={} remote_code={}",
            selection.as_str(),
            resolved.reference.to_string(),
            resolved.family.as_str(),
            properties.quantization.is_some(),
            properties.trust_remote_code,
        );
    }
    Ok(())
}

async fn handle_prepare(
    config: &PipelineConfig,
    workspace: &Path,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config, workspace)?;
    let resolved = pipeline.resolve(config.training.model_selection)?;
    let tokenizer = pipeline.tokenizer(&resolved.reference).await?;
    let prepared = pipeline
        .prepare(&config.dataset, tokenizer.as_ref(), resolved.strategy())
        .await?;

    println!(
        "{} for {} ({}): {} train, {} validation",
        config.dataset.dataset,
        resolved.reference,
        resolved.family,
        prepared.train.len(),
        prepared.validation.len()
    );
    if let Some(path) = output {
        atomic_write(&path, &serde_json::to_vec(&prepared)?)?;
        println!("Wrote prepared dataset to {}", path.display());
    }
    Ok(())
}

async fn handle_run(
    config: &PipelineConfig,
    workspace: &Path,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config, workspace)?;
    let summary = pipeline
        .run(&config.training, &config.dataset, config.export.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!("{} stage failed: {}", e.stage(), e))?;

    let json = serde_json::to_string_pretty(&summary)?;
    if let Some(path) = output {
        atomic_write(&path, json.as_bytes())?;
        println!("Wrote run summary to {}", path.display());
    } else {
        println!("{json}");
    }
    Ok(())
}

async fn handle_evaluate(
    config: &PipelineConfig,
    workspace: &Path,
    manifest: &Path,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config, workspace)?;
    let stored = FsModelStore::open(manifest)?;
    let results = pipeline.evaluate_stored(&stored, &config.dataset).await?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

async fn handle_export(
    config: &PipelineConfig,
    workspace: &Path,
    manifest: &Path,
    destination: &ModelReference,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config, workspace)?;
    let stored = FsModelStore::open(manifest)?;
    let trained = pipeline.load_stored(&stored)?;
    let exported = pipeline.export(&trained, destination).await?;
    println!("Exported {} to {}", trained.id, exported);
    Ok(())
}
