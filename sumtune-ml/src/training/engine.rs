//! Fine-tuning engine: loads a base model under its family's policy, attaches a low-rank
//! adapter and drives one of the two trainer kinds.
//!
//! The supervised path hands back its model directly. The instruction path only exposes
//! the adapted model through save events, so the engine reads it from a
//! [`CheckpointCapture`] once training returns.

use crate::backend::{
    AdapterTransform, ExecutionMode, InstructionOptions, InstructionTrainer, LoadPolicy,
    MetricsSink, ModelRepository, RuntimeFlags, SupervisedTrainer, Tokenizer,
    TrainJob, TrainOutput,
};
use crate::config::{IntervalStrategy, TrainingConfig};
use crate::data::PreparedSplit;
use crate::error::TuneError;
use crate::family::registry::{FamilyRegistry, ModelProperties, PadTokenSource};
use crate::family::strategy::{FamilyStrategy, TEXT_FIELD};
use crate::reference::ModelReference;
use crate::training::callbacks::{CheckpointCapture, LogMetricsCallback, TrainerCallback};
use crate::training::trained::{TrainedModel, TrainingSummary};
use std::sync::Arc;

/// Apply the family's padding policy to a freshly loaded tokenizer.
pub fn prepare_tokenizer(
    tokenizer: &mut dyn Tokenizer,
    properties: &ModelProperties,
    reference: &ModelReference,
) -> Result<(), TuneError> {
    match properties.pad_token {
        Some(PadTokenSource::EosToken) => {
            let eos = tokenizer.eos_token().ok_or_else(|| {
                TuneError::model_load(reference, "tokenizer has no end-of-sequence token to pad with")
            })?;
            tokenizer.set_pad_token(&eos)?;
            tracing::debug!(model = %reference, pad = %eos, "Padding with end-of-sequence token");
        }
        None => {}
    }
    Ok(())
}

/// Collaborators the engine drives.
pub struct FineTuningEngine {
    registry: Arc<FamilyRegistry>,
    repository: Arc<dyn ModelRepository>,
    adapter: Arc<dyn AdapterTransform>,
    supervised: Arc<dyn SupervisedTrainer>,
    instruction: Arc<dyn InstructionTrainer>,
    metrics: Arc<dyn MetricsSink>,
}

impl FineTuningEngine {
    pub fn new(
        registry: Arc<FamilyRegistry>,
        repository: Arc<dyn ModelRepository>,
        adapter: Arc<dyn AdapterTransform>,
        supervised: Arc<dyn SupervisedTrainer>,
        instruction: Arc<dyn InstructionTrainer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            repository,
            adapter,
            supervised,
            instruction,
            metrics,
        }
    }

    /// Fine-tune `reference` on the prepared splits.
    ///
    /// Trainer failures (out-of-memory included) are returned as [`TuneError::Training`]
    /// and never retried.
    pub async fn train(
        &self,
        reference: &ModelReference,
        config: &TrainingConfig,
        train: &PreparedSplit,
        validation: &PreparedSplit,
        tokenizer: &dyn Tokenizer,
    ) -> Result<TrainedModel, TuneError> {
        let properties = self.registry.properties_for_reference(reference)?;
        let strategy = FamilyStrategy::for_family(properties.family);

        if config.adapter.target_modules.is_empty() {
            return Err(TuneError::model_load(
                reference,
                "adapter config names no target modules",
            ));
        }
        for (name, split) in [("train", train), ("validation", validation)] {
            if split.family() != properties.family {
                return Err(TuneError::invalid_input(format!(
                    "{name} split is formatted for {} but {reference} is {}",
                    split.family(),
                    properties.family
                )));
            }
        }
        if tokenizer.pad_token_id().is_none() {
            return Err(TuneError::model_load(
                reference,
                "tokenizer has no padding token; apply the family pad policy first",
            ));
        }
        if strategy.captures_checkpoint() && config.arguments.save_strategy == IntervalStrategy::No
        {
            return Err(TuneError::training(
                reference,
                "save_strategy 'no' leaves no checkpoint to capture",
            ));
        }

        let policy = LoadPolicy {
            family: properties.family,
            device_placement: properties.device_placement,
            quantization: properties.quantization.clone(),
            trust_remote_code: properties.trust_remote_code,
        };
        let mut model = self
            .repository
            .load(reference, &policy)
            .await
            .map_err(|e| as_load_error(reference, e))?;
        tracing::info!(
            model = %reference,
            family = %properties.family,
            quantized = policy.quantization.is_some(),
            "Loaded base model"
        );

        // Activations are recomputed during training, so the key-value cache is useless.
        model.flags = RuntimeFlags {
            use_cache: false,
            mode: ExecutionMode::Train,
        };

        let adapter = strategy.adapter_config(&config.adapter);
        let mut log_metrics = LogMetricsCallback::new(self.metrics.clone());

        let (trained, output, checkpoints_seen) = match strategy {
            FamilyStrategy::SeqToSeq => {
                let wrapped = self
                    .adapter
                    .wrap(model, &adapter)
                    .await
                    .map_err(|e| as_load_error(reference, e))?;
                let job = TrainJob {
                    model: wrapped,
                    arguments: &config.arguments,
                    train,
                    validation,
                };
                let mut callbacks: [&mut dyn TrainerCallback; 1] = [&mut log_metrics];
                let trained = self
                    .supervised
                    .train(job, &mut callbacks)
                    .await
                    .map_err(|e| as_training_error(reference, e))?;
                let output = TrainOutput {
                    global_step: log_metrics.metrics().last_step,
                    training_loss: log_metrics.metrics().final_loss(),
                };
                (trained, output, 0)
            }
            FamilyStrategy::Causal => {
                let options = InstructionOptions {
                    adapter,
                    packing: false,
                    text_field: TEXT_FIELD.to_string(),
                };
                let job = TrainJob {
                    model,
                    arguments: &config.arguments,
                    train,
                    validation,
                };
                let mut capture = CheckpointCapture::new();
                let mut callbacks: [&mut dyn TrainerCallback; 2] =
                    [&mut log_metrics, &mut capture];
                let output = self
                    .instruction
                    .train(job, &options, &mut callbacks)
                    .await
                    .map_err(|e| as_training_error(reference, e))?;
                let saves = capture.saves();
                let (state, captured) = capture.into_captured().ok_or_else(|| {
                    TuneError::training(reference, "trainer finished without a save event")
                })?;
                tracing::debug!(step = state.global_step, saves, "Using last captured checkpoint");
                (captured, output, saves)
            }
        };

        let adapter_state = trained.adapter.clone().ok_or_else(|| {
            TuneError::training(reference, "trained model carries no adapter state")
        })?;

        let summary = TrainingSummary {
            global_step: output.global_step,
            training_loss: output.training_loss,
            checkpoints_seen,
            metrics: log_metrics.into_metrics(),
        };
        tracing::info!(
            model = %reference,
            steps = summary.global_step,
            loss = ?summary.training_loss,
            "Fine-tuning finished"
        );
        Ok(TrainedModel::new(
            reference.clone(),
            trained,
            adapter_state,
            summary,
        ))
    }
}

fn as_load_error(reference: &ModelReference, err: TuneError) -> TuneError {
    match err {
        TuneError::ModelLoad { .. } => err,
        other => TuneError::model_load(reference, other.to_string()),
    }
}

fn as_training_error(reference: &ModelReference, err: TuneError) -> TuneError {
    match err {
        TuneError::Training { .. } => err,
        other => TuneError::training(reference, other.to_string()),
    }
}
