//! Collaborator interfaces the core drives: model repository, tokenizer, trainers,
//! generation and metrics.
//!
//! Concrete adapters live in the submodules; in-memory fakes live in [`crate::testing`].

pub mod hub;
pub mod worker;

use crate::config::{AdapterConfig, TrainingArguments};
use crate::data::PreparedSplit;
use crate::error::TuneError;
use crate::family::registry::{DevicePlacement, QuantizationConfig};
use crate::family::selection::ModelFamily;
use crate::reference::ModelReference;
use crate::training::callbacks::TrainerCallback;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Whether a model is set up for optimisation or for generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Train,
    Inference,
}

/// Mutable runtime flags carried alongside a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeFlags {
    /// Key-value cache. Off while training (activation recomputation), on for generation.
    pub use_cache: bool,
    pub mode: ExecutionMode,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self {
            use_cache: true,
            mode: ExecutionMode::Inference,
        }
    }
}

/// Adapter weights attached to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterState {
    pub config: AdapterConfig,
    /// Checkpoint directory holding the adapter weights, once saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<PathBuf>,
    /// Global step the adapter weights were saved at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
}

/// Backend-issued identity of a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    /// Identifier meaningful to the backend that issued it.
    pub id: String,
    pub reference: ModelReference,
    pub family: ModelFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<AdapterState>,
    #[serde(default)]
    pub flags: RuntimeFlags,
}

impl ModelHandle {
    pub fn is_adapted(&self) -> bool {
        self.adapter.is_some()
    }
}

/// Loading policy derived from the family's properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPolicy {
    pub family: ModelFamily,
    pub device_placement: DevicePlacement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<QuantizationConfig>,
    pub trust_remote_code: bool,
}

/// Commit identifier returned by a push.
pub type CommitId = String;

/// Token ids and attention masks for a batch of texts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
}

/// Padding behaviour for [`Tokenizer::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    None,
    /// Pad every sequence to `max_length`.
    MaxLength,
}

/// Tokenization primitives.
pub trait Tokenizer: Send + Sync {
    /// Encode texts. `max_length` bounds truncation and fixed-length padding.
    fn encode(
        &self,
        texts: &[String],
        max_length: Option<usize>,
        padding: Padding,
        truncate: bool,
    ) -> Result<TokenBatch, TuneError>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TuneError>;

    fn pad_token_id(&self) -> Option<u32>;

    fn eos_token(&self) -> Option<String>;

    /// Use `token` (already in the vocabulary) as the padding token.
    fn set_pad_token(&mut self, token: &str) -> Result<(), TuneError>;
}

/// Loads tokenizers for pretrained models.
#[async_trait]
pub trait TokenizerSource: Send + Sync {
    async fn load_tokenizer(
        &self,
        reference: &ModelReference,
    ) -> Result<Box<dyn Tokenizer>, TuneError>;
}

/// Remote model repository client.
#[async_trait]
pub trait ModelRepository: Send + Sync {
    /// Load pretrained weights under `policy`.
    async fn load(
        &self,
        reference: &ModelReference,
        policy: &LoadPolicy,
    ) -> Result<ModelHandle, TuneError>;

    /// Push model weights, adapter state included, with authenticated access.
    async fn push(
        &self,
        model: &ModelHandle,
        destination: &ModelReference,
    ) -> Result<CommitId, TuneError>;
}

/// Wraps a base model with trainable adapter layers.
#[async_trait]
pub trait AdapterTransform: Send + Sync {
    async fn wrap(
        &self,
        model: ModelHandle,
        adapter: &AdapterConfig,
    ) -> Result<ModelHandle, TuneError>;
}

/// Inputs shared by both trainer kinds.
pub struct TrainJob<'a> {
    pub model: ModelHandle,
    pub arguments: &'a TrainingArguments,
    pub train: &'a PreparedSplit,
    pub validation: &'a PreparedSplit,
}

/// Standard supervised trainer over paired input/label tensors.
#[async_trait]
pub trait SupervisedTrainer: Send + Sync {
    /// Train and return the trainer's post-training model.
    async fn train(
        &self,
        job: TrainJob<'_>,
        callbacks: &mut [&mut dyn TrainerCallback],
    ) -> Result<ModelHandle, TuneError>;
}

/// Settings specific to the instruction-tuning trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionOptions {
    pub adapter: AdapterConfig,
    pub packing: bool,
    pub text_field: String,
}

/// Summary statistics a trainer reports when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainOutput {
    pub global_step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_loss: Option<f64>,
}

/// Instruction-tuning trainer that applies the adapter itself.
///
/// It does not hand back the adapter-wrapped model; callers observe it through
/// [`TrainerCallback::on_save`].
#[async_trait]
pub trait InstructionTrainer: Send + Sync {
    async fn train(
        &self,
        job: TrainJob<'_>,
        options: &InstructionOptions,
        callbacks: &mut [&mut dyn TrainerCallback],
    ) -> Result<TrainOutput, TuneError>;
}

/// Prompt fed to [`Generator::generate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationInput {
    pub input_ids: Vec<u32>,
    pub attention_mask: Option<Vec<u32>>,
}

/// Autoregressive generation.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Returns only the newly generated token ids, never the prompt.
    async fn generate(
        &self,
        model: &ModelHandle,
        input: &GenerationInput,
        max_new_tokens: usize,
    ) -> Result<Vec<u32>, TuneError>;
}

/// Fire-and-forget metric emission.
pub trait MetricsSink: Send + Sync {
    fn log_metric(&self, name: &str, value: f64);
}
