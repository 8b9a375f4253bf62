//! Training: engine, trainer callbacks, metrics and the trained-model type.

pub mod callbacks;
pub mod engine;
pub mod metrics;
pub mod trained;

pub use callbacks::{CheckpointCapture, LogMetricsCallback, TrainerCallback, TrainerState};
pub use engine::{FineTuningEngine, prepare_tokenizer};
pub use metrics::{RecordedMetrics, TracingMetrics, TrainingMetrics};
pub use trained::{TrainedModel, TrainingSummary};
