//! Training metrics tracking and metric sinks.

use crate::backend::MetricsSink;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Metrics a trainer reported during one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub logs_received: usize,
    pub last_step: u64,
    pub loss_history: Vec<f64>,
    pub eval_loss_history: Vec<f64>,
    pub custom_metrics: BTreeMap<String, Vec<f64>>,
    pub best_eval_loss: Option<f64>,
}

impl TrainingMetrics {
    pub fn record(&mut self, step: u64, logs: &BTreeMap<String, f64>) {
        self.logs_received += 1;
        self.last_step = self.last_step.max(step);
        for (name, &value) in logs {
            match name.as_str() {
                "loss" => self.loss_history.push(value),
                "eval_loss" => {
                    self.eval_loss_history.push(value);
                    if self.best_eval_loss.is_none_or(|best| value < best) {
                        self.best_eval_loss = Some(value);
                    }
                }
                _ => self.add_custom_metric(name, value),
            }
        }
    }

    pub fn add_custom_metric(&mut self, name: &str, value: f64) {
        self.custom_metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    pub fn final_loss(&self) -> Option<f64> {
        self.loss_history.last().copied()
    }
}

/// Emits each metric as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn log_metric(&self, name: &str, value: f64) {
        tracing::info!(target: "sumtune::metrics", metric = name, value, "metric");
    }
}

/// Keeps every metric in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordedMetrics {
    entries: Mutex<Vec<(String, f64)>>,
}

impl RecordedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<(String, f64)> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Every value recorded under `name`.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.snapshot()
            .into_iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .collect()
    }
}

impl MetricsSink for RecordedMetrics {
    fn log_metric(&self, name: &str, value: f64) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push((name.to_string(), value));
    }
}
