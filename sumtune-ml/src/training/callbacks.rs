//! Trainer hooks: metric forwarding and checkpoint capture.

use crate::backend::{MetricsSink, ModelHandle};
use crate::training::metrics::TrainingMetrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Trainer progress at the time a hook fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<f64>,
}

/// Hooks a trainer invokes while it runs. Both default to no-ops.
pub trait TrainerCallback: Send {
    /// Called whenever the trainer reports metrics.
    fn on_log(&mut self, _state: &TrainerState, _logs: &BTreeMap<String, f64>) {}

    /// Called after a checkpoint is written; `model` is the model as saved.
    fn on_save(&mut self, _state: &TrainerState, _model: &ModelHandle) {}
}

/// Forwards every reported metric to a [`MetricsSink`] and keeps a local history.
pub struct LogMetricsCallback {
    sink: Arc<dyn MetricsSink>,
    metrics: TrainingMetrics,
}

impl LogMetricsCallback {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            metrics: TrainingMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn into_metrics(self) -> TrainingMetrics {
        self.metrics
    }
}

impl TrainerCallback for LogMetricsCallback {
    fn on_log(&mut self, state: &TrainerState, logs: &BTreeMap<String, f64>) {
        self.sink.log_metric("step", state.global_step as f64);
        for (name, value) in logs {
            self.sink.log_metric(name, *value);
        }
        self.metrics.record(state.global_step, logs);
    }
}

/// Holds the model from the most recent save event.
///
/// Each save replaces the slot, so after training it holds the last saved model.
#[derive(Debug, Default)]
pub struct CheckpointCapture {
    captured: Option<(TrainerState, ModelHandle)>,
    saves: usize,
}

impl CheckpointCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of save events observed.
    pub fn saves(&self) -> usize {
        self.saves
    }

    /// Consume the capture, yielding the last saved model and its state.
    pub fn into_captured(self) -> Option<(TrainerState, ModelHandle)> {
        self.captured
    }
}

impl TrainerCallback for CheckpointCapture {
    fn on_save(&mut self, state: &TrainerState, model: &ModelHandle) {
        tracing::debug!(step = state.global_step, model = %model.id, "Captured checkpoint");
        self.saves += 1;
        self.captured = Some((*state, model.clone()));
    }
}
