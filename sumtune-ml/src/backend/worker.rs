//! Python worker bridge.
//!
//! Implements the model-side collaborators over a JSON-lines protocol spoken with a
//! persistent worker process. Requests are tagged by `op`; the worker streams back
//! `log` and `save` events and finishes each request with a `result` or an `error`.
//!
//! The crate ships a worker built on transformers, peft and trl. It is written to the
//! configured script path on first use when no script exists there.

use crate::backend::{
    AdapterTransform, CommitId, GenerationInput, Generator, InstructionOptions,
    InstructionTrainer, LoadPolicy, ModelHandle, ModelRepository, SupervisedTrainer, TrainJob,
    TrainOutput,
};
use crate::config::{AdapterConfig, PythonConfig, TrainingArguments};
use crate::data::PreparedSplit;
use crate::error::TuneError;
use crate::reference::ModelReference;
use crate::runtime::{PythonRuntime, WorkerSession};
use crate::storage::atomic_write;
use crate::training::callbacks::{TrainerCallback, TrainerState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Worker script shipped with the crate.
pub const BUNDLED_WORKER: &str = include_str!("../../assets/worker.py");

/// Write [`BUNDLED_WORKER`] to `path` unless a file already exists there.
///
/// Returns whether the script was written.
pub fn install_worker_script(path: &Path) -> Result<bool, TuneError> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    atomic_write(path, BUNDLED_WORKER.as_bytes())?;
    tracing::info!(script = %path.display(), "Installed bundled worker script");
    Ok(true)
}

/// One request to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    Load {
        reference: ModelReference,
        policy: LoadPolicy,
    },
    WrapAdapter {
        model: ModelHandle,
        adapter: AdapterConfig,
    },
    TrainSupervised {
        model: ModelHandle,
        arguments: TrainingArguments,
        train_path: PathBuf,
        validation_path: PathBuf,
    },
    TrainInstruction {
        model: ModelHandle,
        arguments: TrainingArguments,
        options: InstructionOptions,
        train_path: PathBuf,
        validation_path: PathBuf,
    },
    Generate {
        model: ModelHandle,
        input_ids: Vec<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attention_mask: Option<Vec<u32>>,
        max_new_tokens: usize,
    },
    Push {
        model: ModelHandle,
        destination: ModelReference,
    },
}

impl WorkerRequest {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::WrapAdapter { .. } => "wrap_adapter",
            Self::TrainSupervised { .. } => "train_supervised",
            Self::TrainInstruction { .. } => "train_instruction",
            Self::Generate { .. } => "generate",
            Self::Push { .. } => "push",
        }
    }
}

/// Failure class reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    Load,
    Oom,
    Training,
    Generation,
    Auth,
    Conflict,
    #[serde(other)]
    Other,
}

/// One line emitted by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Log {
        step: u64,
        #[serde(default)]
        epoch: Option<f64>,
        #[serde(default)]
        metrics: BTreeMap<String, f64>,
    },
    Save {
        step: u64,
        #[serde(default)]
        epoch: Option<f64>,
        checkpoint: PathBuf,
        model: ModelHandle,
    },
    Result {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Error {
        kind: WorkerErrorKind,
        message: String,
    },
}

impl WorkerEvent {
    pub fn parse(line: &str) -> Result<Self, TuneError> {
        serde_json::from_str(line)
            .map_err(|e| TuneError::Python(format!("malformed worker event '{line}': {e}")))
    }
}

/// Map a worker error onto the crate taxonomy. `subject` is the model or destination
/// the request was about.
///
/// The worker does not know which validation example it is generating for, so
/// generation errors carry index 0 and the evaluator restamps them.
pub fn worker_error(kind: WorkerErrorKind, subject: &str, message: String) -> TuneError {
    match kind {
        WorkerErrorKind::Load => TuneError::model_load(subject, message),
        WorkerErrorKind::Oom => TuneError::training(subject, format!("out of memory: {message}")),
        WorkerErrorKind::Training => TuneError::training(subject, message),
        WorkerErrorKind::Auth => TuneError::ExportAuth {
            destination: subject.to_string(),
            message,
        },
        WorkerErrorKind::Conflict => TuneError::ExportConflict {
            destination: subject.to_string(),
            message,
        },
        WorkerErrorKind::Generation => TuneError::generation(0, format!("{subject}: {message}")),
        WorkerErrorKind::Other => TuneError::Python(format!("{subject}: {message}")),
    }
}

#[derive(Debug, Deserialize)]
struct PushResult {
    commit: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResult {
    output_ids: Vec<u32>,
}

/// Model repository, adapter transform, both trainers and generator backed by one
/// worker process.
pub struct PythonWorker {
    runtime: PythonRuntime,
    script: PathBuf,
    session: Mutex<Option<WorkerSession>>,
}

impl PythonWorker {
    pub fn new(runtime: PythonRuntime, script: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            script: script.into(),
            session: Mutex::new(None),
        }
    }

    pub fn from_config(config: &PythonConfig, workspace: PathBuf) -> Self {
        Self::new(
            PythonRuntime::from_config(config, workspace),
            config.worker_script.clone(),
        )
    }

    /// Configured script, resolved against the workspace.
    fn script_path(&self) -> PathBuf {
        if self.script.is_absolute() {
            self.script.clone()
        } else {
            self.runtime.workspace().join(&self.script)
        }
    }

    /// Send `request` and drive its events until a result or error arrives.
    ///
    /// The worker is spawned on first use. A timeout or an exited worker drops the
    /// session; the next request starts a fresh process.
    async fn request(
        &self,
        request: &WorkerRequest,
        subject: &str,
        callbacks: &mut [&mut dyn TrainerCallback],
    ) -> Result<serde_json::Value, TuneError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            let script = self.script_path();
            install_worker_script(&script)?;
            *guard = Some(self.runtime.spawn_worker(&script).await?);
        }
        let Some(session) = guard.as_mut() else {
            return Err(TuneError::Python("worker session unavailable".to_string()));
        };

        let op = request.op();
        tracing::debug!(op, subject, "Sending worker request");
        let timeout = self.runtime.timeout();
        let outcome = tokio::time::timeout(timeout, async {
            session.send(&serde_json::to_value(request)?).await?;
            drive(session, subject, callbacks).await
        })
        .await;

        match outcome {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(err)) => {
                if matches!(err, TuneError::Python(_) | TuneError::Io(_))
                    && session.try_status().is_some()
                {
                    *guard = None;
                }
                Err(err)
            }
            Err(_) => {
                *guard = None;
                Err(TuneError::Timeout(format!(
                    "worker '{op}' request for {subject} timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Write both splits as JSON lines under `<output_dir>/data`.
    async fn stage_splits(
        arguments: &TrainingArguments,
        train: &PreparedSplit,
        validation: &PreparedSplit,
    ) -> Result<(PathBuf, PathBuf), TuneError> {
        let dir = arguments.output_dir.join("data");
        tokio::fs::create_dir_all(&dir).await?;
        let train_path = dir.join("train.jsonl");
        let validation_path = dir.join("validation.jsonl");
        write_split(&train_path, train).await?;
        write_split(&validation_path, validation).await?;
        Ok((train_path, validation_path))
    }
}

/// Read events until the request finishes, dispatching hooks on the way.
async fn drive(
    session: &mut WorkerSession,
    subject: &str,
    callbacks: &mut [&mut dyn TrainerCallback],
) -> Result<serde_json::Value, TuneError> {
    loop {
        let Some(line) = session.next_line().await? else {
            return Err(TuneError::Python(format!(
                "worker exited while handling request for {subject}"
            )));
        };
        match WorkerEvent::parse(&line)? {
            WorkerEvent::Log {
                step,
                epoch,
                metrics,
            } => {
                let state = TrainerState {
                    global_step: step,
                    epoch,
                };
                for cb in callbacks.iter_mut() {
                    cb.on_log(&state, &metrics);
                }
            }
            WorkerEvent::Save {
                step,
                epoch,
                checkpoint,
                model,
            } => {
                tracing::debug!(step, checkpoint = %checkpoint.display(), "Worker saved checkpoint");
                let state = TrainerState {
                    global_step: step,
                    epoch,
                };
                for cb in callbacks.iter_mut() {
                    cb.on_save(&state, &model);
                }
            }
            WorkerEvent::Result { payload } => return Ok(payload),
            WorkerEvent::Error { kind, message } => {
                return Err(worker_error(kind, subject, message));
            }
        }
    }
}

async fn write_split(path: &Path, split: &PreparedSplit) -> Result<(), TuneError> {
    let mut buf = Vec::new();
    match split {
        PreparedSplit::SeqToSeq(examples) => {
            for example in examples {
                serde_json::to_writer(&mut buf, example)?;
                buf.push(b'\n');
            }
        }
        PreparedSplit::Causal(examples) => {
            for example in examples {
                serde_json::to_writer(&mut buf, example)?;
                buf.push(b'\n');
            }
        }
    }
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(&buf).await?;
    file.flush().await?;
    Ok(())
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    op: &str,
    payload: serde_json::Value,
) -> Result<T, TuneError> {
    serde_json::from_value(payload)
        .map_err(|e| TuneError::Python(format!("unexpected '{op}' result: {e}")))
}

#[async_trait]
impl ModelRepository for PythonWorker {
    async fn load(
        &self,
        reference: &ModelReference,
        policy: &LoadPolicy,
    ) -> Result<ModelHandle, TuneError> {
        let request = WorkerRequest::Load {
            reference: reference.clone(),
            policy: policy.clone(),
        };
        let payload = self
            .request(&request, &reference.to_string(), &mut [])
            .await?;
        decode_payload(request.op(), payload)
    }

    async fn push(
        &self,
        model: &ModelHandle,
        destination: &ModelReference,
    ) -> Result<CommitId, TuneError> {
        let request = WorkerRequest::Push {
            model: model.clone(),
            destination: destination.clone(),
        };
        let payload = self
            .request(&request, &destination.to_string(), &mut [])
            .await?;
        let result: PushResult = decode_payload(request.op(), payload)?;
        Ok(result.commit)
    }
}

#[async_trait]
impl AdapterTransform for PythonWorker {
    async fn wrap(
        &self,
        model: ModelHandle,
        adapter: &AdapterConfig,
    ) -> Result<ModelHandle, TuneError> {
        let subject = model.reference.to_string();
        let request = WorkerRequest::WrapAdapter {
            model,
            adapter: adapter.clone(),
        };
        let payload = self.request(&request, &subject, &mut []).await?;
        decode_payload(request.op(), payload)
    }
}

#[async_trait]
impl SupervisedTrainer for PythonWorker {
    async fn train(
        &self,
        job: TrainJob<'_>,
        callbacks: &mut [&mut dyn TrainerCallback],
    ) -> Result<ModelHandle, TuneError> {
        let (train_path, validation_path) =
            Self::stage_splits(job.arguments, job.train, job.validation).await?;
        let subject = job.model.reference.to_string();
        let request = WorkerRequest::TrainSupervised {
            model: job.model,
            arguments: job.arguments.clone(),
            train_path,
            validation_path,
        };
        let payload = self.request(&request, &subject, callbacks).await?;
        decode_payload(request.op(), payload)
    }
}

#[async_trait]
impl InstructionTrainer for PythonWorker {
    async fn train(
        &self,
        job: TrainJob<'_>,
        options: &InstructionOptions,
        callbacks: &mut [&mut dyn TrainerCallback],
    ) -> Result<TrainOutput, TuneError> {
        let (train_path, validation_path) =
            Self::stage_splits(job.arguments, job.train, job.validation).await?;
        let subject = job.model.reference.to_string();
        let request = WorkerRequest::TrainInstruction {
            model: job.model,
            arguments: job.arguments.clone(),
            options: options.clone(),
            train_path,
            validation_path,
        };
        let payload = self.request(&request, &subject, callbacks).await?;
        decode_payload(request.op(), payload)
    }
}

#[async_trait]
impl Generator for PythonWorker {
    async fn generate(
        &self,
        model: &ModelHandle,
        input: &GenerationInput,
        max_new_tokens: usize,
    ) -> Result<Vec<u32>, TuneError> {
        let request = WorkerRequest::Generate {
            model: model.clone(),
            input_ids: input.input_ids.clone(),
            attention_mask: input.attention_mask.clone(),
            max_new_tokens,
        };
        let payload = self
            .request(&request, &model.reference.to_string(), &mut [])
            .await?;
        let result: GenerateResult = decode_payload(request.op(), payload)?;
        Ok(result.output_ids)
    }
}
