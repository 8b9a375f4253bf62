//! Sequential fine-tune → store → evaluate → export run.
//!
//! Every stage consumes the previous stage's output and the first failure ends the run.
//! The stage methods are public so the CLI can run them on their own.

use crate::backend::hub::HubTokenizerSource;
use crate::backend::worker::PythonWorker;
use crate::backend::{
    AdapterTransform, Generator, InstructionTrainer, MetricsSink, ModelRepository,
    SupervisedTrainer, Tokenizer, TokenizerSource,
};
use crate::config::{
    DatasetConfig, DatasetSourceConfig, EvalSettings, PipelineConfig, TrainingConfig,
};
use crate::data::{
    DatasetPreparer, DatasetService, HubDatasetService, JsonlDatasetService, PreparedDataset,
};
use crate::error::TuneError;
use crate::eval::{EvaluationResults, Evaluator};
use crate::export::Exporter;
use crate::family::{FamilyRegistry, FamilyStrategy, ModelFamily, ModelSelection};
use crate::reference::ModelReference;
use crate::storage::{FsModelStore, ModelStore, StoredModel};
use crate::training::{FineTuningEngine, TracingMetrics, TrainedModel, prepare_tokenizer};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::Instrument;

/// A selection resolved through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub selection: ModelSelection,
    pub reference: ModelReference,
    pub family: ModelFamily,
}

impl ResolvedModel {
    pub fn strategy(&self) -> FamilyStrategy {
        FamilyStrategy::for_family(self.family)
    }
}

/// What a completed run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub source: ModelReference,
    pub family: ModelFamily,
    pub stored: StoredModel,
    pub evaluation: EvaluationResults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported: Option<ModelReference>,
}

/// External services a pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub datasets: Arc<dyn DatasetService>,
    pub tokenizers: Arc<dyn TokenizerSource>,
    pub repository: Arc<dyn ModelRepository>,
    pub adapter: Arc<dyn AdapterTransform>,
    pub supervised: Arc<dyn SupervisedTrainer>,
    pub instruction: Arc<dyn InstructionTrainer>,
    pub generator: Arc<dyn Generator>,
    pub metrics: Arc<dyn MetricsSink>,
    pub store: Arc<dyn ModelStore>,
}

impl Collaborators {
    /// Hub or JSONL datasets, hub tokenizers, one Python worker for every model
    /// operation, tracing metrics and filesystem storage.
    pub fn from_config(config: &PipelineConfig, workspace: &Path) -> Self {
        let datasets: Arc<dyn DatasetService> = match &config.source {
            DatasetSourceConfig::Hub => Arc::new(HubDatasetService::new(config.hub.clone())),
            DatasetSourceConfig::Jsonl { dir } => {
                Arc::new(JsonlDatasetService::new(workspace.join(dir)))
            }
        };
        let worker = Arc::new(PythonWorker::from_config(
            &config.python,
            workspace.to_path_buf(),
        ));
        Self {
            datasets,
            tokenizers: Arc::new(HubTokenizerSource::from_env(&config.hub.token_env)),
            repository: worker.clone(),
            adapter: worker.clone(),
            supervised: worker.clone(),
            instruction: worker.clone(),
            generator: worker,
            metrics: Arc::new(TracingMetrics),
            store: Arc::new(FsModelStore::new()),
        }
    }
}

pub struct Pipeline {
    registry: Arc<FamilyRegistry>,
    services: Collaborators,
    evaluation: EvalSettings,
}

impl Pipeline {
    pub fn new(registry: Arc<FamilyRegistry>, services: Collaborators) -> Self {
        Self {
            registry,
            services,
            evaluation: EvalSettings::default(),
        }
    }

    /// Built-in registry and the concrete collaborators named by `config`.
    pub fn from_config(config: &PipelineConfig, workspace: &Path) -> Result<Self, TuneError> {
        let registry = Arc::new(FamilyRegistry::builtin()?);
        Ok(Self::new(registry, Collaborators::from_config(config, workspace))
            .with_evaluation(config.evaluation.clone()))
    }

    pub fn with_evaluation(mut self, evaluation: EvalSettings) -> Self {
        self.evaluation = evaluation;
        self
    }

    pub fn registry(&self) -> &FamilyRegistry {
        &self.registry
    }

    pub fn resolve(&self, selection: ModelSelection) -> Result<ResolvedModel, TuneError> {
        let (reference, family) = self.registry.resolve(selection)?;
        Ok(ResolvedModel {
            selection,
            reference,
            family,
        })
    }

    /// Load the tokenizer for `reference` and apply its family's padding policy.
    pub async fn tokenizer(
        &self,
        reference: &ModelReference,
    ) -> Result<Box<dyn Tokenizer>, TuneError> {
        let properties = self.registry.properties_for_reference(reference)?;
        let mut tokenizer = self.services.tokenizers.load_tokenizer(reference).await?;
        prepare_tokenizer(tokenizer.as_mut(), properties, reference)?;
        Ok(tokenizer)
    }

    pub async fn prepare(
        &self,
        config: &DatasetConfig,
        tokenizer: &dyn Tokenizer,
        strategy: FamilyStrategy,
    ) -> Result<PreparedDataset, TuneError> {
        DatasetPreparer::new(self.services.datasets.clone())
            .prepare(config, tokenizer, strategy)
            .await
    }

    pub async fn train(
        &self,
        reference: &ModelReference,
        config: &TrainingConfig,
        prepared: &PreparedDataset,
        tokenizer: &dyn Tokenizer,
    ) -> Result<TrainedModel, TuneError> {
        self.engine()
            .train(
                reference,
                config,
                &prepared.train,
                &prepared.validation,
                tokenizer,
            )
            .await
    }

    pub fn store(&self, trained: &TrainedModel, dir: &Path) -> Result<StoredModel, TuneError> {
        self.services.store.store(trained, dir)
    }

    pub fn load_stored(&self, stored: &StoredModel) -> Result<TrainedModel, TuneError> {
        self.services.store.load(stored)
    }

    /// Evaluate with the strategy resolved for this run.
    pub async fn evaluate(
        &self,
        trained: &mut TrainedModel,
        prepared: &PreparedDataset,
        tokenizer: &dyn Tokenizer,
        strategy: FamilyStrategy,
    ) -> Result<EvaluationResults, TuneError> {
        if strategy.family() != trained.family || prepared.family() != trained.family {
            return Err(TuneError::invalid_input(format!(
                "{} model {} cannot be evaluated as {} on {} data",
                trained.family,
                trained.id,
                strategy.family(),
                prepared.family()
            )));
        }
        Evaluator::new(
            self.services.generator.clone(),
            self.evaluation.max_new_tokens,
        )
        .evaluate(trained, &prepared.validation, tokenizer, strategy)
        .await
    }

    /// Evaluate a stored model against a freshly prepared validation split.
    pub async fn evaluate_stored(
        &self,
        stored: &StoredModel,
        dataset: &DatasetConfig,
    ) -> Result<EvaluationResults, TuneError> {
        let mut trained = self.load_stored(stored)?;
        let properties = self.registry.properties_for_reference(&trained.source)?;
        let strategy = FamilyStrategy::for_family(properties.family);
        let tokenizer = self.tokenizer(&trained.source).await?;
        let prepared = self.prepare(dataset, tokenizer.as_ref(), strategy).await?;
        self.evaluate(&mut trained, &prepared, tokenizer.as_ref(), strategy)
            .await
    }

    pub async fn export(
        &self,
        trained: &TrainedModel,
        destination: &ModelReference,
    ) -> Result<ModelReference, TuneError> {
        Exporter::new(self.services.repository.clone())
            .export(trained, destination)
            .await
    }

    /// Run every stage in order. Nothing is exported when `export` is `None`.
    pub async fn run(
        &self,
        training: &TrainingConfig,
        dataset: &DatasetConfig,
        export: Option<&ModelReference>,
    ) -> Result<ResultSummary, TuneError> {
        let resolved = self.resolve(training.model_selection)?;
        let strategy = resolved.strategy();
        tracing::info!(
            selection = %resolved.selection,
            model = %resolved.reference,
            family = %resolved.family,
            "Starting run"
        );

        let tokenizer = self
            .tokenizer(&resolved.reference)
            .instrument(tracing::info_span!("tokenizer"))
            .await?;

        let prepared = self
            .prepare(dataset, tokenizer.as_ref(), strategy)
            .instrument(tracing::info_span!("prepare", dataset = %dataset.dataset))
            .await?;

        let mut trained = self
            .train(&resolved.reference, training, &prepared, tokenizer.as_ref())
            .instrument(tracing::info_span!("train", model = %resolved.reference))
            .await?;

        let stored = tracing::info_span!("store", model = %trained.id)
            .in_scope(|| self.store(&trained, &training.storage_directory))?;

        let evaluate_span = tracing::info_span!("evaluate", model = %trained.id);
        let evaluation = self
            .evaluate(&mut trained, &prepared, tokenizer.as_ref(), strategy)
            .instrument(evaluate_span)
            .await?;

        let exported = match export {
            Some(destination) => Some(
                self.export(&trained, destination)
                    .instrument(tracing::info_span!("export", destination = %destination))
                    .await?,
            ),
            None => None,
        };

        tracing::info!(
            model = %trained.id,
            responses = evaluation.len(),
            exported = exported.is_some(),
            "Run finished"
        );
        Ok(ResultSummary {
            source: resolved.reference,
            family: resolved.family,
            stored,
            evaluation,
            exported,
        })
    }

    fn engine(&self) -> FineTuningEngine {
        FineTuningEngine::new(
            self.registry.clone(),
            self.services.repository.clone(),
            self.services.adapter.clone(),
            self.services.supervised.clone(),
            self.services.instruction.clone(),
            self.services.metrics.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DatasetDict;
    use crate::testing::{FakeStack, summarization_split};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn training(selection: ModelSelection, dir: &TempDir) -> TrainingConfig {
        let mut config = TrainingConfig {
            model_selection: selection,
            storage_directory: dir.path().join("models"),
            ..TrainingConfig::default()
        };
        config.arguments.output_dir = dir.path().join("out");
        config
    }

    fn dataset(max_train: usize, max_test: usize) -> DatasetConfig {
        DatasetConfig {
            max_train_samples: Some(max_train),
            max_test_samples: Some(max_test),
            ..DatasetConfig::default()
        }
    }

    #[test]
    fn test_resolve() {
        let stack = FakeStack::new(DatasetDict::new());
        let pipeline = stack.pipeline().unwrap();
        let resolved = pipeline.resolve(ModelSelection::Falcon7b).unwrap();
        assert_eq!(resolved.family, ModelFamily::Causal);
        assert_eq!(resolved.strategy(), FamilyStrategy::Causal);
        assert_eq!(resolved.reference, ModelSelection::Falcon7b.reference());
    }

    #[tokio::test]
    async fn test_causal_tokenizer_pads_with_eos() {
        let stack = FakeStack::new(DatasetDict::new());
        let pipeline = stack.pipeline().unwrap();
        let tokenizer = pipeline
            .tokenizer(&ModelSelection::GptJ6b.reference())
            .await
            .unwrap();
        assert_eq!(tokenizer.pad_token_id(), Some(1));
    }

    #[tokio::test]
    async fn test_run_without_export_stores_and_evaluates() {
        let dir = TempDir::new().unwrap();
        let dict = DatasetDict::new()
            .with_split("train", summarization_split(20))
            .with_split("validation", summarization_split(5));
        let stack = FakeStack::new(dict);
        let pipeline = stack.pipeline().unwrap();

        let summary = pipeline
            .run(
                &training(ModelSelection::GptJ6b, &dir),
                &dataset(8, 3),
                None,
            )
            .await
            .unwrap();

        assert_eq!(summary.family, ModelFamily::Causal);
        assert_eq!(summary.evaluation.len(), 3);
        assert!(summary.exported.is_none());
        assert!(summary.stored.manifest.starts_with(dir.path().join("models")));
        assert!(stack.repository.pushes.lock().unwrap().is_empty());

        let trained = pipeline.load_stored(&summary.stored).unwrap();
        assert_eq!(trained.model.id, "ckpt-10");
        assert_eq!(trained.summary.checkpoints_seen, 2);
    }

    #[tokio::test]
    async fn test_dataset_failure_stops_before_training() {
        let dir = TempDir::new().unwrap();
        let dict = DatasetDict::new().with_split("validation", summarization_split(5));
        let stack = FakeStack::new(dict);
        let err = stack
            .pipeline()
            .unwrap()
            .run(&training(ModelSelection::FlanBase, &dir), &dataset(8, 3), None)
            .await
            .unwrap_err();

        assert!(matches!(err, TuneError::DatasetSplit { .. }));
        assert!(stack.repository.loads.lock().unwrap().is_empty());
        assert!(!dir.path().join("models").exists());
    }

    #[tokio::test]
    async fn test_evaluate_rejects_mismatched_strategy() {
        let dir = TempDir::new().unwrap();
        let dict = DatasetDict::new()
            .with_split("train", summarization_split(12))
            .with_split("validation", summarization_split(4));
        let stack = FakeStack::new(dict);
        let pipeline = stack.pipeline().unwrap();

        let summary = pipeline
            .run(&training(ModelSelection::FlanSmall, &dir), &dataset(6, 2), None)
            .await
            .unwrap();
        let calls_after_run = stack.generator.calls.lock().unwrap().len();

        let mut trained = pipeline.load_stored(&summary.stored).unwrap();
        let resolved = pipeline.resolve(ModelSelection::FlanSmall).unwrap();
        let tokenizer = pipeline.tokenizer(&resolved.reference).await.unwrap();
        let prepared = pipeline
            .prepare(&dataset(6, 2), tokenizer.as_ref(), resolved.strategy())
            .await
            .unwrap();

        let err = pipeline
            .evaluate(&mut trained, &prepared, tokenizer.as_ref(), FamilyStrategy::Causal)
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::InvalidInput(_)));
        assert_eq!(stack.generator.calls.lock().unwrap().len(), calls_after_run);

        let results = pipeline
            .evaluate(&mut trained, &prepared, tokenizer.as_ref(), resolved.strategy())
            .await
            .unwrap();
        assert_eq!(results, summary.evaluation);
    }

    #[tokio::test]
    async fn test_evaluate_stored_model() {
        let dir = TempDir::new().unwrap();
        let dict = DatasetDict::new()
            .with_split("train", summarization_split(12))
            .with_split("test", summarization_split(4));
        let stack = FakeStack::new(dict);
        let pipeline = stack.pipeline().unwrap();

        let summary = pipeline
            .run(
                &training(ModelSelection::FlanSmall, &dir),
                &dataset(6, 2),
                None,
            )
            .await
            .unwrap();

        let reloaded = FsModelStore::open(&summary.stored.manifest).unwrap();
        let again = pipeline
            .evaluate_stored(&reloaded, &dataset(6, 2))
            .await
            .unwrap();
        assert_eq!(again, summary.evaluation);
    }
}
