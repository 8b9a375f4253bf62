//! Configuration for fine-tuning runs.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace `.sumtune/config.toml` -> `SUMTUNE_` environment -> explicit overrides.

use crate::error::TuneError;
use crate::family::selection::{ModelFamily, ModelSelection};
use crate::reference::{DatasetReference, ModelReference};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything a pipeline run consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub evaluation: EvalSettings,
    /// Destination for the trained model; no export when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ModelReference>,
    /// Where raw datasets are read from.
    #[serde(default)]
    pub source: DatasetSourceConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub python: PythonConfig,
}

/// Adapter task type expected by the adapter library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterTask {
    #[serde(rename = "SEQ_2_SEQ_LM")]
    Seq2SeqLm,
    CausalLm,
}

impl AdapterTask {
    pub fn for_family(family: ModelFamily) -> Self {
        match family {
            ModelFamily::SeqToSeq => Self::Seq2SeqLm,
            ModelFamily::Causal => Self::CausalLm,
        }
    }
}

/// Low-rank adapter configuration. Passed through to the adapter library unchanged
/// except for the task type, which the engine fills from the model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_rank")]
    pub rank: u32,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<AdapterTask>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            rank: default_rank(),
            alpha: default_alpha(),
            dropout: default_dropout(),
            target_modules: default_target_modules(),
            bias: default_bias(),
            task_type: None,
        }
    }
}

fn default_rank() -> u32 {
    16
}

fn default_alpha() -> f32 {
    32.0
}

fn default_dropout() -> f32 {
    0.05
}

fn default_target_modules() -> Vec<String> {
    vec!["q".to_string(), "v".to_string()]
}

fn default_bias() -> String {
    "none".to_string()
}

/// When the trainer evaluates or saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalStrategy {
    No,
    Steps,
    Epoch,
}

/// Trainer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArguments {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_interval")]
    pub evaluation_strategy: IntervalStrategy,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_true")]
    pub auto_find_batch_size: bool,
    #[serde(default = "default_epochs")]
    pub num_train_epochs: usize,
    #[serde(default = "default_interval")]
    pub save_strategy: IntervalStrategy,
    #[serde(default = "default_save_total_limit")]
    pub save_total_limit: usize,
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            evaluation_strategy: default_interval(),
            learning_rate: default_learning_rate(),
            gradient_accumulation_steps: default_grad_accum(),
            auto_find_batch_size: true,
            num_train_epochs: default_epochs(),
            save_strategy: default_interval(),
            save_total_limit: default_save_total_limit(),
            logging_steps: default_logging_steps(),
            seed: default_seed(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".sumtune/output")
}

fn default_interval() -> IntervalStrategy {
    IntervalStrategy::Epoch
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_grad_accum() -> usize {
    1
}

fn default_epochs() -> usize {
    1
}

fn default_save_total_limit() -> usize {
    1
}

fn default_logging_steps() -> usize {
    10
}

fn default_seed() -> u64 {
    42
}

/// What to fine-tune and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_selection")]
    pub model_selection: ModelSelection,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub arguments: TrainingArguments,
    /// Directory the trained model manifest is stored in.
    #[serde(default = "default_storage_dir")]
    pub storage_directory: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_selection: default_selection(),
            adapter: AdapterConfig::default(),
            arguments: TrainingArguments::default(),
            storage_directory: default_storage_dir(),
        }
    }
}

fn default_selection() -> ModelSelection {
    ModelSelection::FlanBase
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".sumtune/models")
}

/// Which dataset to use and how to shape it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default = "default_dataset")]
    pub dataset: DatasetReference,
    #[serde(default = "default_text_column")]
    pub text_column: String,
    #[serde(default = "default_summary_column")]
    pub summary_column: String,
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,
    #[serde(default = "default_max_output_length")]
    pub max_output_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_train_samples: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_test_samples: Option<usize>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            text_column: default_text_column(),
            summary_column: default_summary_column(),
            max_input_length: default_max_input_length(),
            max_output_length: default_max_output_length(),
            max_train_samples: None,
            max_test_samples: None,
        }
    }
}

fn default_dataset() -> DatasetReference {
    DatasetReference::new("abisee", "cnn_dailymail").with_subset("3.0.0")
}

fn default_text_column() -> String {
    "article".to_string()
}

fn default_summary_column() -> String {
    "highlights".to_string()
}

fn default_max_input_length() -> usize {
    512
}

fn default_max_output_length() -> usize {
    128
}

/// Generation settings for evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalSettings {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
        }
    }
}

fn default_max_new_tokens() -> usize {
    500
}

/// Raw dataset origin.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatasetSourceConfig {
    /// Hugging Face datasets server.
    #[default]
    Hub,
    /// Local directory with one `<split>.jsonl` file per split.
    Jsonl { dir: PathBuf },
}

/// Hugging Face endpoints and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_datasets_server")]
    pub datasets_server_url: String,
    /// Rows requested per page from the datasets server (the server caps this at 100).
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Upper bound on rows fetched per split; `None` fetches whole splits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_limit: Option<usize>,
    /// Environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            datasets_server_url: default_datasets_server(),
            page_size: default_page_size(),
            fetch_limit: None,
            token_env: default_token_env(),
        }
    }
}

fn default_datasets_server() -> String {
    "https://datasets-server.huggingface.co".to_string()
}

fn default_page_size() -> usize {
    100
}

fn default_token_env() -> String {
    "HF_TOKEN".to_string()
}

/// Python worker process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PythonConfig {
    /// Path to Python executable.
    #[serde(default = "default_python_path")]
    pub python_path: PathBuf,
    /// Virtual environment whose interpreter takes precedence over `python_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venv_path: Option<PathBuf>,
    /// Worker script implementing the JSON-lines protocol.
    #[serde(default = "default_worker_script")]
    pub worker_script: PathBuf,
    /// Per-request timeout in seconds. Training requests usually need hours.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            python_path: default_python_path(),
            venv_path: None,
            worker_script: default_worker_script(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_python_path() -> PathBuf {
    PathBuf::from("python3")
}

fn default_worker_script() -> PathBuf {
    PathBuf::from(".sumtune/worker.py")
}

fn default_request_timeout() -> u64 {
    24 * 3600
}

fn default_true() -> bool {
    true
}

/// Load configuration with layered precedence.
///
/// `extra_file` is merged after the workspace file, for an explicit `--config` path.
/// `overrides` is a sparse table: only the keys it names replace lower layers.
pub fn load_config(
    workspace: Option<&Path>,
    extra_file: Option<&Path>,
    overrides: Option<&serde_json::Value>,
) -> Result<PipelineConfig, TuneError> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "sumtune", "sumtune") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".sumtune").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = extra_file {
        if !path.exists() {
            return Err(TuneError::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    // SUMTUNE_TRAINING__MODEL_SELECTION, SUMTUNE_DATASET__MAX_TRAIN_SAMPLES, ...
    figment = figment.merge(Env::prefixed("SUMTUNE_").split("__"));

    if let Some(overrides) = overrides {
        if !overrides.is_object() {
            return Err(TuneError::Config(
                "overrides must be a table of configuration keys".to_string(),
            ));
        }
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment
        .extract()
        .map_err(|e| TuneError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.training.model_selection, ModelSelection::FlanBase);
        assert_eq!(config.dataset.text_column, "article");
        assert_eq!(config.dataset.summary_column, "highlights");
        assert_eq!(config.evaluation.max_new_tokens, 500);
        assert_eq!(config.training.arguments.seed, 42);
        assert!(config.export.is_none());
        assert_eq!(config.source, DatasetSourceConfig::Hub);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let mut config = PipelineConfig::default();
        config.export = Some(ModelReference::new("acme", "sum-model"));
        config.dataset.max_train_samples = Some(10);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.export, config.export);
        assert_eq!(parsed.dataset, config.dataset);
        assert_eq!(parsed.training, config.training);
    }

    #[test]
    fn test_adapter_task_names() {
        assert_eq!(
            serde_json::to_string(&AdapterTask::Seq2SeqLm).unwrap(),
            "\"SEQ_2_SEQ_LM\""
        );
        assert_eq!(
            serde_json::to_string(&AdapterTask::CausalLm).unwrap(),
            "\"CAUSAL_LM\""
        );
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".sumtune");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            r#"
export = "acme/sum-model"

[training]
model_selection = "gpt_j_6b"

[training.adapter]
rank = 8
target_modules = ["q_proj", "v_proj"]

[dataset]
dataset = "abisee/cnn_dailymail:3.0.0"
max_train_samples = 900
max_test_samples = 100

[source]
type = "jsonl"
dir = "data"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None, None).unwrap();
        assert_eq!(config.training.model_selection, ModelSelection::GptJ6b);
        assert_eq!(config.training.adapter.rank, 8);
        assert_eq!(config.training.adapter.alpha, 32.0);
        assert_eq!(config.dataset.max_train_samples, Some(900));
        assert_eq!(
            config.export,
            Some(ModelReference::new("acme", "sum-model"))
        );
        assert_eq!(
            config.source,
            DatasetSourceConfig::Jsonl {
                dir: PathBuf::from("data")
            }
        );
    }

    #[test]
    fn test_load_config_with_overrides() {
        let overrides = serde_json::json!({
            "training": { "model_selection": "flan_small" },
            "evaluation": { "max_new_tokens": 64 },
        });

        let config = load_config(None, None, Some(&overrides)).unwrap();
        assert_eq!(config.training.model_selection, ModelSelection::FlanSmall);
        assert_eq!(config.evaluation.max_new_tokens, 64);
        assert_eq!(config.training.adapter.rank, AdapterConfig::default().rank);
    }

    #[test]
    fn test_override_keeps_unrelated_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".sumtune");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            "[training.adapter]\nrank = 8\n\n[dataset]\nmax_train_samples = 900\n",
        )
        .unwrap();

        let overrides = serde_json::json!({ "evaluation": { "max_new_tokens": 64 } });
        let config = load_config(Some(dir.path()), None, Some(&overrides)).unwrap();
        assert_eq!(config.training.adapter.rank, 8);
        assert_eq!(config.dataset.max_train_samples, Some(900));
        assert_eq!(config.evaluation.max_new_tokens, 64);
    }

    #[test]
    fn test_non_table_overrides_rejected() {
        let err = load_config(None, None, Some(&serde_json::json!(64))).unwrap_err();
        assert!(matches!(err, TuneError::Config(_)));
    }

    #[test]
    fn test_env_selects_model() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SUMTUNE_TRAINING__MODEL_SELECTION", "gpt_j_6b");
            jail.set_env("SUMTUNE_DATASET__MAX_TRAIN_SAMPLES", "250");

            let config = load_config(Some(jail.directory()), None, None)
                .map_err(|e| e.to_string())?;
            assert_eq!(config.training.model_selection, ModelSelection::GptJ6b);
            assert_eq!(config.dataset.max_train_samples, Some(250));
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_workspace_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_dir(".sumtune")?;
            jail.create_file(
                ".sumtune/config.toml",
                r#"
[training]
model_selection = "flan_small"

[dataset]
max_test_samples = 100
"#,
            )?;
            jail.set_env("SUMTUNE_TRAINING__MODEL_SELECTION", "falcon_7b");

            let config = load_config(Some(jail.directory()), None, None)
                .map_err(|e| e.to_string())?;
            assert_eq!(config.training.model_selection, ModelSelection::Falcon7b);
            assert_eq!(config.dataset.max_test_samples, Some(100));

            let overrides = serde_json::json!({ "training": { "model_selection": "flan_large" } });
            let config = load_config(Some(jail.directory()), None, Some(&overrides))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.training.model_selection, ModelSelection::FlanLarge);
            Ok(())
        });
    }

    #[test]
    fn test_missing_extra_file_is_config_error() {
        let err = load_config(None, Some(Path::new("/nonexistent/sumtune.toml")), None)
            .unwrap_err();
        assert!(matches!(err, TuneError::Config(_)));
    }
}
