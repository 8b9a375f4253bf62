//! Error types for the sumtune-ml crate.

use thiserror::Error;

/// Top-level error type for fine-tuning, evaluation and export.
///
/// The first group of variants is the stage taxonomy: each carries the identifier
/// (model selection, dataset, model, example index or destination) needed to reproduce
/// the failure. None of them are retried inside the crate.
#[derive(Debug, Error)]
pub enum TuneError {
    #[error("Unknown model selection '{selection}': {message}")]
    UnknownModelSelection { selection: String, message: String },

    #[error("Dataset split error for '{dataset}': {message}")]
    DatasetSplit { dataset: String, message: String },

    #[error("Failed to load model '{model}': {message}")]
    ModelLoad { model: String, message: String },

    #[error("Training failed for '{model}': {message}")]
    Training { model: String, message: String },

    #[error("Generation failed at example {index}: {message}")]
    Generation { index: usize, message: String },

    #[error("Not authorized to push to '{destination}': {message}")]
    ExportAuth {
        destination: String,
        message: String,
    },

    #[error("Push to '{destination}' conflicts with existing content: {message}")]
    ExportConflict {
        destination: String,
        message: String,
    },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Python worker error: {0}")]
    Python(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TuneError {
    pub fn unknown_selection(selection: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UnknownModelSelection {
            selection: selection.into(),
            message: msg.into(),
        }
    }

    pub fn split(dataset: impl ToString, msg: impl Into<String>) -> Self {
        Self::DatasetSplit {
            dataset: dataset.to_string(),
            message: msg.into(),
        }
    }

    pub fn model_load(model: impl ToString, msg: impl Into<String>) -> Self {
        Self::ModelLoad {
            model: model.to_string(),
            message: msg.into(),
        }
    }

    pub fn training(model: impl ToString, msg: impl Into<String>) -> Self {
        Self::Training {
            model: model.to_string(),
            message: msg.into(),
        }
    }

    pub fn generation(index: usize, msg: impl Into<String>) -> Self {
        Self::Generation {
            index,
            message: msg.into(),
        }
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn tokenizer(msg: impl Into<String>) -> Self {
        Self::Tokenizer(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Name of the pipeline stage this error belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::UnknownModelSelection { .. } => "registry",
            Self::DatasetSplit { .. } | Self::Dataset(_) => "dataset",
            Self::Tokenizer(_) => "tokenizer",
            Self::ModelLoad { .. } => "load",
            Self::Training { .. } => "train",
            Self::Generation { .. } => "evaluate",
            Self::ExportAuth { .. } | Self::ExportConflict { .. } => "export",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Python(_) | Self::Timeout(_) => "worker",
            Self::InvalidInput(_) | Self::Io(_) | Self::Serde(_) | Self::Http(_) => "io",
        }
    }
}
