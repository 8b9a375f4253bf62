//! Pushes trained models to a remote model repository.

use crate::backend::ModelRepository;
use crate::error::TuneError;
use crate::reference::ModelReference;
use crate::training::trained::TrainedModel;
use std::sync::Arc;

pub struct Exporter {
    repository: Arc<dyn ModelRepository>,
}

impl Exporter {
    pub fn new(repository: Arc<dyn ModelRepository>) -> Self {
        Self { repository }
    }

    /// Push `trained` to `destination` and return the destination pinned to the new commit.
    ///
    /// Authorization and conflict failures are returned as-is. A destination that already
    /// names a commit cannot be pushed to.
    pub async fn export(
        &self,
        trained: &TrainedModel,
        destination: &ModelReference,
    ) -> Result<ModelReference, TuneError> {
        if destination.is_pinned() {
            return Err(TuneError::invalid_input(format!(
                "export destination {destination} already names a commit"
            )));
        }

        let commit = self.repository.push(&trained.model, destination).await?;
        let exported = destination.with_commit(commit);
        tracing::info!(
            source = %trained.source,
            destination = %exported,
            "Exported trained model"
        );
        Ok(exported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AdapterState, ModelHandle, RuntimeFlags};
    use crate::config::AdapterConfig;
    use crate::family::selection::ModelSelection;
    use crate::testing::{FakeRepository, PushFailure};
    use crate::training::trained::TrainingSummary;

    fn trained() -> TrainedModel {
        let reference = ModelSelection::FlanBase.reference();
        let adapter = AdapterState {
            config: AdapterConfig::default(),
            checkpoint: None,
            step: None,
        };
        TrainedModel::new(
            reference.clone(),
            ModelHandle {
                id: "m".to_string(),
                reference,
                family: ModelSelection::FlanBase.naming_family(),
                location: None,
                adapter: Some(adapter.clone()),
                flags: RuntimeFlags::default(),
            },
            adapter,
            TrainingSummary::default(),
        )
    }

    #[tokio::test]
    async fn test_export_pins_commit() {
        let repository = Arc::new(FakeRepository::new());
        let exporter = Exporter::new(repository.clone());
        let destination = ModelReference::new("acme", "sum-model");

        let exported = exporter.export(&trained(), &destination).await.unwrap();
        assert_eq!(exported.owner(), "acme");
        assert_eq!(exported.repo(), "sum-model");
        assert!(exported.is_pinned());
        assert_eq!(exported.commit().map(str::len), Some(40));

        let pushes = repository.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1, destination);
    }

    #[tokio::test]
    async fn test_export_errors_propagate() {
        let destination = ModelReference::new("acme", "sum-model");
        let auth = Exporter::new(Arc::new(FakeRepository::failing_push(PushFailure::Auth)));
        assert!(matches!(
            auth.export(&trained(), &destination).await.unwrap_err(),
            TuneError::ExportAuth { .. }
        ));

        let conflict =
            Exporter::new(Arc::new(FakeRepository::failing_push(PushFailure::Conflict)));
        assert!(matches!(
            conflict.export(&trained(), &destination).await.unwrap_err(),
            TuneError::ExportConflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_pinned_destination_rejected() {
        let repository = Arc::new(FakeRepository::new());
        let exporter = Exporter::new(repository.clone());
        let destination = ModelReference::new("acme", "sum-model").with_commit("abc123");
        let err = exporter.export(&trained(), &destination).await.unwrap_err();
        assert!(matches!(err, TuneError::InvalidInput(_)));
        assert!(repository.pushes.lock().unwrap().is_empty());
    }
}
