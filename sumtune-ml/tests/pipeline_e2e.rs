//! End-to-end pipeline runs over the in-memory collaborators.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use sumtune_ml::backend::ExecutionMode;
use sumtune_ml::config::{DatasetConfig, TrainingConfig};
use sumtune_ml::data::DatasetDict;
use sumtune_ml::testing::{
    FakeInstructionTrainer, FakeRepository, FakeStack, PushFailure, summarization_split,
};
use sumtune_ml::{ModelFamily, ModelReference, ModelSelection, TuneError};
use tempfile::TempDir;

fn training(selection: ModelSelection, dir: &TempDir) -> TrainingConfig {
    let mut config = TrainingConfig {
        model_selection: selection,
        storage_directory: dir.path().join("models"),
        ..TrainingConfig::default()
    };
    config.arguments.output_dir = dir.path().join("output");
    config
}

fn capped(max_train: usize, max_test: usize) -> DatasetConfig {
    DatasetConfig {
        max_train_samples: Some(max_train),
        max_test_samples: Some(max_test),
        ..DatasetConfig::default()
    }
}

fn cnn_like() -> DatasetDict {
    DatasetDict::new()
        .with_split("train", summarization_split(100))
        .with_split("validation", summarization_split(20))
        .with_split("test", summarization_split(20))
}

#[tokio::test]
async fn flan_base_run_trains_and_evaluates_in_order() {
    let dir = TempDir::new().unwrap();
    let stack = FakeStack::new(cnn_like());
    let pipeline = stack.pipeline().unwrap();

    let summary = pipeline
        .run(&training(ModelSelection::FlanBase, &dir), &capped(10, 2), None)
        .await
        .unwrap();

    assert_eq!(summary.source, ModelSelection::FlanBase.reference());
    assert_eq!(summary.family, ModelFamily::SeqToSeq);

    let jobs = stack.supervised.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].train_len, 10);
    assert_eq!(jobs[0].validation_len, 2);
    assert!(!jobs[0].flags.use_cache);
    assert_eq!(jobs[0].flags.mode, ExecutionMode::Train);
    assert!(stack.instruction.jobs.lock().unwrap().is_empty());

    assert_eq!(summary.evaluation.len(), 2);
    assert!(summary.evaluation.continuations[0].prompt.contains("article number 0 about"));
    assert!(summary.evaluation.continuations[1].prompt.contains("article number 1 about"));

    let calls = stack.generator.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.flags.use_cache));
    assert!(calls.iter().all(|c| c.flags.mode == ExecutionMode::Inference));
    assert!(calls.iter().all(|c| c.max_new_tokens == 500));

    let trained = pipeline.load_stored(&summary.stored).unwrap();
    assert!(trained.model.is_adapted());
    assert_eq!(trained.summary.checkpoints_seen, 0);
}

#[tokio::test]
async fn causal_run_uses_last_checkpoint() {
    let dir = TempDir::new().unwrap();
    let stack = FakeStack::new(cnn_like());
    let pipeline = stack.pipeline().unwrap();

    let summary = pipeline
        .run(&training(ModelSelection::GptJ6b, &dir), &capped(10, 2), None)
        .await
        .unwrap();

    let trained = pipeline.load_stored(&summary.stored).unwrap();
    assert_eq!(trained.model.id, "ckpt-10");
    assert_eq!(trained.adapter.step, Some(10));
    assert!(stack.supervised.jobs.lock().unwrap().is_empty());

    let options = stack.instruction.options.lock().unwrap();
    assert!(!options[0].packing);
    assert_eq!(options[0].text_field, "text");

    // Causal prompts stop at the summary marker.
    for response in &summary.evaluation.continuations {
        assert!(response.prompt.ends_with("**Summary**: "), "{}", response.prompt);
    }

    let loads = stack.repository.loads.lock().unwrap();
    assert!(loads[0].1.quantization.is_some());
    assert!(loads[0].1.trust_remote_code);
}

#[tokio::test]
async fn causal_run_without_save_fails() {
    let dir = TempDir::new().unwrap();
    let mut stack = FakeStack::new(cnn_like());
    stack.instruction = Arc::new(FakeInstructionTrainer::with_saves(vec![]));
    let err = stack
        .pipeline()
        .unwrap()
        .run(&training(ModelSelection::Falcon7b, &dir), &capped(10, 2), None)
        .await
        .unwrap_err();

    assert!(matches!(err, TuneError::Training { .. }));
    assert_eq!(err.stage(), "train");
    assert!(stack.generator.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn export_pins_destination_commit() {
    let dir = TempDir::new().unwrap();
    let stack = FakeStack::new(cnn_like());
    let destination = ModelReference::new("acme", "sum-model");

    let summary = stack
        .pipeline()
        .unwrap()
        .run(
            &training(ModelSelection::FlanBase, &dir),
            &capped(10, 2),
            Some(&destination),
        )
        .await
        .unwrap();

    let exported = summary.exported.unwrap();
    assert_eq!(exported.owner(), "acme");
    assert_eq!(exported.repo(), "sum-model");
    assert!(exported.commit().is_some_and(|c| !c.is_empty()));
    assert_eq!(exported.to_string(), format!("acme/sum-model@{}", exported.commit().unwrap()));
}

#[tokio::test]
async fn export_auth_failure_surfaces_after_storage() {
    let dir = TempDir::new().unwrap();
    let mut stack = FakeStack::new(cnn_like());
    stack.repository = Arc::new(FakeRepository::failing_push(PushFailure::Auth));
    let destination = ModelReference::new("acme", "sum-model");

    let err = stack
        .pipeline()
        .unwrap()
        .run(
            &training(ModelSelection::FlanSmall, &dir),
            &capped(10, 2),
            Some(&destination),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TuneError::ExportAuth { .. }));
    assert!(err.to_string().contains("acme/sum-model"));
    // The model was stored before the push was attempted.
    assert!(dir.path().join("models").read_dir().unwrap().next().is_some());
}

#[tokio::test]
async fn summary_serializes_to_json() {
    let dir = TempDir::new().unwrap();
    let stack = FakeStack::new(cnn_like());
    let summary = stack
        .pipeline()
        .unwrap()
        .run(&training(ModelSelection::FlanSmall, &dir), &capped(4, 1), None)
        .await
        .unwrap();

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["source"], "google/flan-t5-small");
    assert_eq!(json["family"], "seq_to_seq");
    assert_eq!(json["evaluation"]["continuations"].as_array().unwrap().len(), 1);
    assert!(json.get("exported").is_none());
}
