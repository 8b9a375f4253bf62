//! The fine-tuned model handed from training to storage, evaluation and export.

use crate::backend::{AdapterState, ModelHandle};
use crate::family::selection::ModelFamily;
use crate::reference::ModelReference;
use crate::training::metrics::TrainingMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the run went, as reported by the trainer and the metrics hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub global_step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_loss: Option<f64>,
    /// Save events observed; zero for trainers that hand back their model directly.
    #[serde(default)]
    pub checkpoints_seen: usize,
    #[serde(default)]
    pub metrics: TrainingMetrics,
}

/// A fine-tuned model with its adapter state. Exactly one owner at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub id: Uuid,
    /// Pretrained model the run started from.
    pub source: ModelReference,
    pub family: ModelFamily,
    pub model: ModelHandle,
    pub adapter: AdapterState,
    pub summary: TrainingSummary,
    pub created_at: DateTime<Utc>,
}

impl TrainedModel {
    pub fn new(
        source: ModelReference,
        model: ModelHandle,
        adapter: AdapterState,
        summary: TrainingSummary,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            family: model.family,
            source,
            model,
            adapter,
            summary,
            created_at: Utc::now(),
        }
    }
}
