//! In-memory collaborators for tests and dry runs.
//!
//! Every fake is deterministic and records what it was asked to do so tests can assert
//! on call order and runtime flags.

use crate::backend::{
    AdapterState, AdapterTransform, CommitId, GenerationInput, Generator, InstructionOptions,
    InstructionTrainer, LoadPolicy, ModelHandle, ModelRepository, Padding, RuntimeFlags,
    SupervisedTrainer, TokenBatch, Tokenizer, TokenizerSource, TrainJob, TrainOutput,
};
use crate::config::AdapterConfig;
use crate::data::{DataSplit, DatasetDict, DatasetService};
use crate::error::TuneError;
use crate::family::FamilyRegistry;
use crate::pipeline::{Collaborators, Pipeline};
use crate::reference::{DatasetReference, ModelReference};
use crate::storage::FsModelStore;
use crate::training::callbacks::{TrainerCallback, TrainerState};
use crate::training::metrics::RecordedMetrics;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `n` rows with `article` / `highlights` columns.
pub fn summarization_split(n: usize) -> DataSplit {
    DataSplit::from_records(
        (0..n)
            .map(|i| {
                serde_json::json!({
                    "id": format!("row-{i}"),
                    "article": format!("article number {i} about topic {}", i % 7),
                    "highlights": format!("summary {i}"),
                })
            })
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

pub const FAKE_PAD: &str = "<pad>";
pub const FAKE_EOS: &str = "</s>";
const FAKE_SPECIALS: [&str; 3] = [FAKE_PAD, FAKE_EOS, "<unk>"];

/// Whitespace tokenizer with a vocabulary that grows as it sees new words.
#[derive(Debug)]
pub struct FakeTokenizer {
    vocab: Mutex<Vec<String>>,
    pad_id: Option<u32>,
    eos: Option<String>,
}

impl FakeTokenizer {
    /// Pads with `<pad>` (id 0); `</s>` (id 1) is the end-of-sequence token.
    pub fn new() -> Self {
        Self {
            vocab: Mutex::new(FAKE_SPECIALS.iter().map(|s| s.to_string()).collect()),
            pad_id: Some(0),
            eos: Some(FAKE_EOS.to_string()),
        }
    }

    /// Like [`FakeTokenizer::new`] but without a padding token, as causal checkpoints ship.
    pub fn without_pad() -> Self {
        Self {
            pad_id: None,
            ..Self::new()
        }
    }

    /// No padding and no end-of-sequence token.
    pub fn without_special_tokens() -> Self {
        Self {
            pad_id: None,
            eos: None,
            ..Self::new()
        }
    }

    fn token_id(&self, word: &str) -> u32 {
        let mut vocab = lock(&self.vocab);
        match vocab.iter().position(|w| w == word) {
            Some(id) => id as u32,
            None => {
                vocab.push(word.to_string());
                (vocab.len() - 1) as u32
            }
        }
    }
}

impl Default for FakeTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for FakeTokenizer {
    fn encode(
        &self,
        texts: &[String],
        max_length: Option<usize>,
        padding: Padding,
        truncate: bool,
    ) -> Result<TokenBatch, TuneError> {
        let mut batch = TokenBatch::default();
        for text in texts {
            let mut ids: Vec<u32> = text.split_whitespace().map(|w| self.token_id(w)).collect();
            if let (true, Some(max)) = (truncate, max_length) {
                ids.truncate(max);
            }
            let mut mask = vec![1; ids.len()];
            if let (Padding::MaxLength, Some(max)) = (padding, max_length) {
                let pad = self
                    .pad_id
                    .ok_or_else(|| TuneError::tokenizer("padding requested without a pad token"))?;
                while ids.len() < max {
                    ids.push(pad);
                    mask.push(0);
                }
            }
            batch.input_ids.push(ids);
            batch.attention_mask.push(mask);
        }
        Ok(batch)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TuneError> {
        let vocab = lock(&self.vocab);
        let mut words = Vec::with_capacity(ids.len());
        for &id in ids {
            let word = vocab
                .get(id as usize)
                .ok_or_else(|| TuneError::tokenizer(format!("unknown token id {id}")))?;
            if skip_special_tokens && (word == FAKE_PAD || word == FAKE_EOS) {
                continue;
            }
            words.push(word.clone());
        }
        Ok(words.join(" "))
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_id
    }

    fn eos_token(&self) -> Option<String> {
        self.eos.clone()
    }

    fn set_pad_token(&mut self, token: &str) -> Result<(), TuneError> {
        let vocab = lock(&self.vocab);
        let id = vocab
            .iter()
            .position(|w| w == token)
            .ok_or_else(|| TuneError::tokenizer(format!("'{token}' is not in the vocabulary")))?;
        drop(vocab);
        self.pad_id = Some(id as u32);
        Ok(())
    }
}

/// Hands out [`FakeTokenizer`]s and records which models they were loaded for.
#[derive(Debug)]
pub struct FakeTokenizerSource {
    pad: bool,
    pub loaded: Mutex<Vec<ModelReference>>,
}

impl FakeTokenizerSource {
    pub fn new() -> Self {
        Self {
            pad: true,
            loaded: Mutex::default(),
        }
    }

    pub fn without_pad() -> Self {
        Self {
            pad: false,
            loaded: Mutex::default(),
        }
    }
}

impl Default for FakeTokenizerSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenizerSource for FakeTokenizerSource {
    async fn load_tokenizer(
        &self,
        reference: &ModelReference,
    ) -> Result<Box<dyn Tokenizer>, TuneError> {
        lock(&self.loaded).push(reference.clone());
        Ok(if self.pad {
            Box::new(FakeTokenizer::new())
        } else {
            Box::new(FakeTokenizer::without_pad())
        })
    }
}

// ---------------------------------------------------------------------------
// Dataset service
// ---------------------------------------------------------------------------

/// Serves a fixed [`DatasetDict`] for any reference.
#[derive(Debug, Default)]
pub struct FakeDatasetService {
    dict: DatasetDict,
    pub requested: Mutex<Vec<DatasetReference>>,
}

impl FakeDatasetService {
    pub fn new(dict: DatasetDict) -> Self {
        Self {
            dict,
            requested: Mutex::default(),
        }
    }
}

#[async_trait]
impl DatasetService for FakeDatasetService {
    async fn load(&self, reference: &DatasetReference) -> Result<DatasetDict, TuneError> {
        lock(&self.requested).push(reference.clone());
        Ok(self.dict.clone())
    }
}

// ---------------------------------------------------------------------------
// Model repository and adapter
// ---------------------------------------------------------------------------

/// Push outcome a [`FakeRepository`] can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFailure {
    Auth,
    Conflict,
}

/// Repository that "loads" by issuing handles and "pushes" by hashing the destination.
#[derive(Debug, Default)]
pub struct FakeRepository {
    push_failure: Option<PushFailure>,
    load_failure: Option<String>,
    pub loads: Mutex<Vec<(ModelReference, LoadPolicy)>>,
    pub pushes: Mutex<Vec<(ModelHandle, ModelReference)>>,
}

impl FakeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_push(failure: PushFailure) -> Self {
        Self {
            push_failure: Some(failure),
            ..Self::default()
        }
    }

    pub fn failing_load(message: impl Into<String>) -> Self {
        Self {
            load_failure: Some(message.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ModelRepository for FakeRepository {
    async fn load(
        &self,
        reference: &ModelReference,
        policy: &LoadPolicy,
    ) -> Result<ModelHandle, TuneError> {
        if let Some(message) = &self.load_failure {
            return Err(TuneError::model_load(reference, message.clone()));
        }
        let mut loads = lock(&self.loads);
        loads.push((reference.clone(), policy.clone()));
        Ok(ModelHandle {
            id: format!("base-{}", loads.len()),
            reference: reference.clone(),
            family: policy.family,
            location: None,
            adapter: None,
            flags: RuntimeFlags::default(),
        })
    }

    async fn push(
        &self,
        model: &ModelHandle,
        destination: &ModelReference,
    ) -> Result<CommitId, TuneError> {
        match self.push_failure {
            Some(PushFailure::Auth) => {
                return Err(TuneError::ExportAuth {
                    destination: destination.to_string(),
                    message: "token lacks write access".to_string(),
                });
            }
            Some(PushFailure::Conflict) => {
                return Err(TuneError::ExportConflict {
                    destination: destination.to_string(),
                    message: "remote has diverged".to_string(),
                });
            }
            None => {}
        }
        let mut pushes = lock(&self.pushes);
        pushes.push((model.clone(), destination.clone()));
        let digest = Sha256::digest(format!("{destination}:{}:{}", model.id, pushes.len()));
        Ok(digest.iter().take(20).map(|b| format!("{b:02x}")).collect())
    }
}

/// Marks models as adapted without touching any weights.
#[derive(Debug, Default)]
pub struct FakeAdapter {
    pub wrapped: Mutex<Vec<AdapterConfig>>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AdapterTransform for FakeAdapter {
    async fn wrap(
        &self,
        mut model: ModelHandle,
        adapter: &AdapterConfig,
    ) -> Result<ModelHandle, TuneError> {
        lock(&self.wrapped).push(adapter.clone());
        model.id = format!("{}+adapter", model.id);
        model.adapter = Some(AdapterState {
            config: adapter.clone(),
            checkpoint: None,
            step: None,
        });
        Ok(model)
    }
}

// ---------------------------------------------------------------------------
// Trainers
// ---------------------------------------------------------------------------

/// What a fake trainer was handed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedJob {
    pub model_id: String,
    pub flags: RuntimeFlags,
    pub train_len: usize,
    pub validation_len: usize,
}

impl RecordedJob {
    fn from_job(job: &TrainJob<'_>) -> Self {
        Self {
            model_id: job.model.id.clone(),
            flags: job.model.flags,
            train_len: job.train.len(),
            validation_len: job.validation.len(),
        }
    }
}

fn log_step(callbacks: &mut [&mut dyn TrainerCallback], step: u64, loss: f64) {
    let state = TrainerState {
        global_step: step,
        epoch: None,
    };
    let logs = BTreeMap::from([("loss".to_string(), loss)]);
    for cb in callbacks.iter_mut() {
        cb.on_log(&state, &logs);
    }
}

/// Supervised trainer that logs a few steps and returns the model it was given.
#[derive(Debug)]
pub struct FakeSupervisedTrainer {
    steps: u64,
    drop_adapter: bool,
    failure: Option<String>,
    pub jobs: Mutex<Vec<RecordedJob>>,
}

impl FakeSupervisedTrainer {
    pub fn new() -> Self {
        Self {
            steps: 3,
            drop_adapter: false,
            failure: None,
            jobs: Mutex::default(),
        }
    }

    /// Returns a model without adapter state.
    pub fn dropping_adapter() -> Self {
        Self {
            drop_adapter: true,
            ..Self::new()
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new()
        }
    }
}

impl Default for FakeSupervisedTrainer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SupervisedTrainer for FakeSupervisedTrainer {
    async fn train(
        &self,
        job: TrainJob<'_>,
        callbacks: &mut [&mut dyn TrainerCallback],
    ) -> Result<ModelHandle, TuneError> {
        lock(&self.jobs).push(RecordedJob::from_job(&job));
        if let Some(message) = &self.failure {
            return Err(TuneError::training(&job.model.reference, message.clone()));
        }
        for step in 1..=self.steps {
            log_step(callbacks, step, 1.0 / step as f64);
        }

        let mut model = job.model;
        model.id = format!("{}+trained", model.id);
        if self.drop_adapter {
            model.adapter = None;
        } else if let Some(adapter) = model.adapter.as_mut() {
            adapter.step = Some(self.steps);
            adapter.checkpoint = Some(
                job.arguments
                    .output_dir
                    .join(format!("checkpoint-{}", self.steps)),
            );
        }
        Ok(model)
    }
}

/// Instruction trainer that emits a save event at each configured step.
#[derive(Debug)]
pub struct FakeInstructionTrainer {
    save_steps: Vec<u64>,
    pub jobs: Mutex<Vec<RecordedJob>>,
    pub options: Mutex<Vec<InstructionOptions>>,
}

impl FakeInstructionTrainer {
    /// Saves at steps 5 and 10.
    pub fn new() -> Self {
        Self::with_saves(vec![5, 10])
    }

    pub fn with_saves(save_steps: Vec<u64>) -> Self {
        Self {
            save_steps,
            jobs: Mutex::default(),
            options: Mutex::default(),
        }
    }
}

impl Default for FakeInstructionTrainer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstructionTrainer for FakeInstructionTrainer {
    async fn train(
        &self,
        job: TrainJob<'_>,
        options: &InstructionOptions,
        callbacks: &mut [&mut dyn TrainerCallback],
    ) -> Result<TrainOutput, TuneError> {
        lock(&self.jobs).push(RecordedJob::from_job(&job));
        lock(&self.options).push(options.clone());

        let mut last_step = 0;
        for &step in &self.save_steps {
            log_step(callbacks, step, 2.0 / step as f64);
            let checkpoint = job.arguments.output_dir.join(format!("checkpoint-{step}"));
            let saved = ModelHandle {
                id: format!("ckpt-{step}"),
                location: Some(checkpoint.clone()),
                adapter: Some(AdapterState {
                    config: options.adapter.clone(),
                    checkpoint: Some(checkpoint),
                    step: Some(step),
                }),
                ..job.model.clone()
            };
            let state = TrainerState {
                global_step: step,
                epoch: None,
            };
            for cb in callbacks.iter_mut() {
                cb.on_save(&state, &saved);
            }
            last_step = step;
        }

        Ok(TrainOutput {
            global_step: last_step,
            training_loss: Some(0.5),
        })
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// What a [`FakeGenerator`] was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedGeneration {
    pub flags: RuntimeFlags,
    pub input: GenerationInput,
    pub max_new_tokens: usize,
}

/// Generator that echoes the unpadded prompt back as the continuation.
#[derive(Debug, Default)]
pub struct FakeGenerator {
    fail_at: Option<usize>,
    pub calls: Mutex<Vec<RecordedGeneration>>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails on the call with this zero-based index.
    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            calls: Mutex::default(),
        }
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(
        &self,
        model: &ModelHandle,
        input: &GenerationInput,
        max_new_tokens: usize,
    ) -> Result<Vec<u32>, TuneError> {
        let mut calls = lock(&self.calls);
        let index = calls.len();
        calls.push(RecordedGeneration {
            flags: model.flags,
            input: input.clone(),
            max_new_tokens,
        });
        if self.fail_at == Some(index) {
            return Err(TuneError::generation(0, "CUDA out of memory"));
        }

        let ids = match &input.attention_mask {
            Some(mask) => input
                .input_ids
                .iter()
                .zip(mask)
                .filter(|&(_, &m)| m == 1)
                .map(|(&id, _)| id)
                .collect::<Vec<_>>(),
            None => input.input_ids.clone(),
        };
        Ok(ids.into_iter().take(max_new_tokens).collect())
    }
}

// ---------------------------------------------------------------------------
// Full stack
// ---------------------------------------------------------------------------

/// One of every fake, wired into a [`Pipeline`] on demand.
pub struct FakeStack {
    pub datasets: Arc<FakeDatasetService>,
    pub tokenizers: Arc<FakeTokenizerSource>,
    pub repository: Arc<FakeRepository>,
    pub adapter: Arc<FakeAdapter>,
    pub supervised: Arc<FakeSupervisedTrainer>,
    pub instruction: Arc<FakeInstructionTrainer>,
    pub generator: Arc<FakeGenerator>,
    pub metrics: Arc<RecordedMetrics>,
}

impl FakeStack {
    pub fn new(dict: DatasetDict) -> Self {
        Self {
            datasets: Arc::new(FakeDatasetService::new(dict)),
            tokenizers: Arc::new(FakeTokenizerSource::new()),
            repository: Arc::new(FakeRepository::new()),
            adapter: Arc::new(FakeAdapter::new()),
            supervised: Arc::new(FakeSupervisedTrainer::new()),
            instruction: Arc::new(FakeInstructionTrainer::new()),
            generator: Arc::new(FakeGenerator::new()),
            metrics: Arc::new(RecordedMetrics::new()),
        }
    }

    /// Collaborators backed by these fakes and a filesystem store.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            datasets: self.datasets.clone(),
            tokenizers: self.tokenizers.clone(),
            repository: self.repository.clone(),
            adapter: self.adapter.clone(),
            supervised: self.supervised.clone(),
            instruction: self.instruction.clone(),
            generator: self.generator.clone(),
            metrics: self.metrics.clone(),
            store: Arc::new(FsModelStore::new()),
        }
    }

    /// Pipeline over the built-in registry.
    pub fn pipeline(&self) -> Result<Pipeline, TuneError> {
        let registry = FamilyRegistry::builtin()?;
        Ok(Pipeline::new(Arc::new(registry), self.collaborators()))
    }
}
