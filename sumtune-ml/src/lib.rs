//! # sumtune-ml: Model-Family-Aware Summarization Fine-Tuning
//!
//! This crate fine-tunes pretrained language models on summarization datasets and
//! evaluates them, treating encoder-decoder ("sequence-to-sequence") and decoder-only
//! ("causal") models through one interface.
//!
//! ## Stages
//!
//! 1. **Registry**: selection → model reference, family and loading policy
//! 2. **Preparer**: validation split resolution, truncation, prompt formatting
//! 3. **Engine**: adapter fine-tuning through one of two trainer kinds
//! 4. **Evaluator**: sequential generation over the validation split
//! 5. **Exporter**: authenticated push that pins the destination commit
//!
//! Heavy lifting (weights, adapters, generation) happens behind the traits in
//! [`backend`]. The bundled [`backend::worker::PythonWorker`] implements them over a
//! JSON-lines subprocess protocol.

// Foundation
pub mod config;
pub mod error;
pub mod reference;
pub mod runtime;

// Policy
pub mod family;

// Collaborators
pub mod backend;

// Stages
pub mod data;
pub mod eval;
pub mod export;
pub mod storage;
pub mod training;

// Orchestration
pub mod pipeline;

// Test support
pub mod testing;

// Re-exports
pub use config::{DatasetConfig, PipelineConfig, TrainingConfig, load_config};
pub use error::TuneError;
pub use eval::{EvaluationResults, Evaluator, PromptResponse, sanitize};
pub use export::Exporter;
pub use family::{FamilyRegistry, FamilyStrategy, ModelFamily, ModelSelection};
pub use pipeline::{Collaborators, Pipeline, ResolvedModel, ResultSummary};
pub use reference::{DatasetReference, ModelReference};
pub use runtime::PythonRuntime;
pub use storage::{FsModelStore, ModelStore, StoredModel};
pub use training::{FineTuningEngine, TrainedModel};
