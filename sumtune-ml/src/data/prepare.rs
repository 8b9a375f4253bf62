//! Builds the train and validation splits a fine-tuning run consumes.
//!
//! Split resolution runs before truncation: an existing `validation` split wins, then a
//! `test` split is renamed, and only a train-only dataset gets a seeded carve.

use crate::backend::Tokenizer;
use crate::config::DatasetConfig;
use crate::data::prepared::PreparedDataset;
use crate::data::source::DatasetService;
use crate::data::split::{DataSplit, DatasetDict};
use crate::error::TuneError;
use crate::family::strategy::FamilyStrategy;
use std::sync::Arc;

pub const TRAIN_SPLIT: &str = "train";
pub const VALIDATION_SPLIT: &str = "validation";
pub const TEST_SPLIT: &str = "test";

/// Seed for carving a validation split out of `train`.
pub const SPLIT_SEED: u64 = 42;

/// Validation share used unless both sample caps are set.
pub const DEFAULT_TEST_FRACTION: f64 = 0.1;

/// Validation share for a carve: the caps' ratio when both are set, else the default.
///
/// Caps that sum to zero yield 0.0, which [`resolve_validation`] rejects.
pub fn split_fraction(max_train: Option<usize>, max_test: Option<usize>) -> f64 {
    match (max_train, max_test) {
        (Some(train), Some(test)) => {
            let total = train as f64 + test as f64;
            if total == 0.0 {
                0.0
            } else {
                test as f64 / total
            }
        }
        _ => DEFAULT_TEST_FRACTION,
    }
}

/// How the validation split was obtained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SplitResolution {
    /// The dataset already had one.
    Existing,
    /// `test` was renamed to `validation`.
    Renamed,
    /// Carved out of `train` with the given share.
    Carved { fraction: f64 },
}

/// Ensure `dict` has `train` and `validation` splits.
///
/// Exactly one of carve or rename happens when `validation` is missing. After a carve the
/// dict has no `test` split; after a rename `test` is gone and its rows are unchanged.
pub fn resolve_validation(
    dict: &mut DatasetDict,
    config: &DatasetConfig,
) -> Result<SplitResolution, TuneError> {
    let dataset = &config.dataset;
    if !dict.contains(TRAIN_SPLIT) {
        return Err(TuneError::split(
            dataset,
            format!("no '{TRAIN_SPLIT}' split (found: {})", dict.split_names().join(", ")),
        ));
    }

    if dict.contains(VALIDATION_SPLIT) {
        return Ok(SplitResolution::Existing);
    }

    if let Some(test) = dict.remove(TEST_SPLIT) {
        tracing::info!(rows = test.len(), "Using '{TEST_SPLIT}' as '{VALIDATION_SPLIT}'");
        dict.insert(VALIDATION_SPLIT, test);
        return Ok(SplitResolution::Renamed);
    }

    let fraction = split_fraction(config.max_train_samples, config.max_test_samples);
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(TuneError::split(
            dataset,
            format!("validation fraction {fraction} is outside (0, 1)"),
        ));
    }

    let train = dict
        .remove(TRAIN_SPLIT)
        .ok_or_else(|| TuneError::split(dataset, "train split vanished during resolution"))?;
    let (train, validation) = train
        .train_test_split(fraction, SPLIT_SEED)
        .map_err(|e| TuneError::split(dataset, e.to_string()))?;
    tracing::info!(
        fraction,
        train = train.len(),
        validation = validation.len(),
        "Carved validation split out of '{TRAIN_SPLIT}'"
    );
    dict.insert(TRAIN_SPLIT, train);
    dict.insert(VALIDATION_SPLIT, validation);
    Ok(SplitResolution::Carved { fraction })
}

/// First `cap` rows of `split`, or all of them without a cap.
pub fn truncate_split(split: &DataSplit, cap: Option<usize>) -> DataSplit {
    match cap {
        Some(n) => split.select(0..n),
        None => split.clone(),
    }
}

/// Loads, resolves, truncates and formats a dataset for one model family.
pub struct DatasetPreparer {
    service: Arc<dyn DatasetService>,
}

impl DatasetPreparer {
    pub fn new(service: Arc<dyn DatasetService>) -> Self {
        Self { service }
    }

    /// Load the dataset and return its resolved, truncated raw splits.
    pub async fn raw_splits(
        &self,
        config: &DatasetConfig,
    ) -> Result<(DataSplit, DataSplit), TuneError> {
        let mut dict = self.service.load(&config.dataset).await?;
        let resolution = resolve_validation(&mut dict, config)?;
        tracing::debug!(?resolution, "Resolved validation split");

        let missing = |name: &str| {
            TuneError::split(&config.dataset, format!("no '{name}' split after resolution"))
        };
        let train = dict.get(TRAIN_SPLIT).ok_or_else(|| missing(TRAIN_SPLIT))?;
        let validation = dict
            .get(VALIDATION_SPLIT)
            .ok_or_else(|| missing(VALIDATION_SPLIT))?;

        let train = truncate_split(train, config.max_train_samples);
        let validation = truncate_split(validation, config.max_test_samples);

        for (name, split) in [(TRAIN_SPLIT, &train), (VALIDATION_SPLIT, &validation)] {
            for column in [&config.text_column, &config.summary_column] {
                if !split.is_empty() && !split.has_column(column) {
                    return Err(TuneError::split(
                        &config.dataset,
                        format!(
                            "split '{name}' has no column '{column}' (available: {})",
                            split.columns().join(", ")
                        ),
                    ));
                }
            }
        }
        Ok((train, validation))
    }

    /// Build formatted train and validation splits for `strategy`'s family.
    pub async fn prepare(
        &self,
        config: &DatasetConfig,
        tokenizer: &dyn Tokenizer,
        strategy: FamilyStrategy,
    ) -> Result<PreparedDataset, TuneError> {
        let (train, validation) = self.raw_splits(config).await?;
        let prepared = PreparedDataset {
            train: strategy.format_split(&train, tokenizer, config)?,
            validation: strategy.format_split(&validation, tokenizer, config)?,
        };
        tracing::info!(
            dataset = %config.dataset,
            family = %strategy.family(),
            train = prepared.train.len(),
            validation = prepared.validation.len(),
            "Prepared dataset"
        );
        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PreparedSplit;
    use crate::testing::{FakeDatasetService, FakeTokenizer, summarization_split};

    fn config(max_train: Option<usize>, max_test: Option<usize>) -> DatasetConfig {
        DatasetConfig {
            max_train_samples: max_train,
            max_test_samples: max_test,
            ..DatasetConfig::default()
        }
    }

    #[test]
    fn test_split_fraction() {
        assert_eq!(split_fraction(Some(900), Some(100)), 0.1);
        assert_eq!(split_fraction(None, None), DEFAULT_TEST_FRACTION);
        assert_eq!(split_fraction(Some(10), None), DEFAULT_TEST_FRACTION);
        assert_eq!(split_fraction(Some(0), Some(0)), 0.0);
    }

    #[test]
    fn test_split_fraction_extreme_caps() {
        assert_eq!(split_fraction(Some(usize::MAX), Some(usize::MAX)), 0.5);
        let fraction = split_fraction(Some(1), Some(usize::MAX));
        assert!(fraction > 0.99 && fraction <= 1.0);
    }

    #[test]
    fn test_existing_validation_untouched() {
        let mut dict = DatasetDict::new()
            .with_split(TRAIN_SPLIT, summarization_split(5))
            .with_split(VALIDATION_SPLIT, summarization_split(2))
            .with_split(TEST_SPLIT, summarization_split(3));
        let resolution = resolve_validation(&mut dict, &config(None, None)).unwrap();
        assert_eq!(resolution, SplitResolution::Existing);
        assert!(dict.contains(TEST_SPLIT));
        assert_eq!(dict.get(VALIDATION_SPLIT).unwrap().len(), 2);
    }

    #[test]
    fn test_train_only_dataset_is_carved() {
        let mut dict = DatasetDict::new().with_split(TRAIN_SPLIT, summarization_split(100));
        let resolution = resolve_validation(&mut dict, &config(None, None)).unwrap();
        assert_eq!(resolution, SplitResolution::Carved { fraction: 0.1 });
        assert_eq!(dict.get(VALIDATION_SPLIT).unwrap().len(), 10);
        assert_eq!(dict.get(TRAIN_SPLIT).unwrap().len(), 90);
        assert!(!dict.contains(TEST_SPLIT));
    }

    #[test]
    fn test_test_split_is_renamed() {
        let mut dict = DatasetDict::new()
            .with_split(TRAIN_SPLIT, summarization_split(20))
            .with_split(TEST_SPLIT, summarization_split(7));
        let resolution = resolve_validation(&mut dict, &config(Some(5), Some(1))).unwrap();
        assert_eq!(resolution, SplitResolution::Renamed);
        assert!(!dict.contains(TEST_SPLIT));
        assert_eq!(dict.get(VALIDATION_SPLIT).unwrap().len(), 7);
        assert_eq!(dict.get(TRAIN_SPLIT).unwrap().len(), 20);
    }

    #[test]
    fn test_missing_train_rejected() {
        let mut dict = DatasetDict::new().with_split(TEST_SPLIT, summarization_split(3));
        let err = resolve_validation(&mut dict, &config(None, None)).unwrap_err();
        assert!(matches!(
            err,
            TuneError::DatasetSplit { ref dataset, .. } if dataset == "abisee/cnn_dailymail:3.0.0"
        ));
    }

    #[test]
    fn test_zero_caps_rejected() {
        let mut dict = DatasetDict::new().with_split(TRAIN_SPLIT, summarization_split(10));
        let err = resolve_validation(&mut dict, &config(Some(0), Some(0))).unwrap_err();
        assert!(matches!(err, TuneError::DatasetSplit { .. }));
    }

    #[test]
    fn test_carve_leaving_empty_side_rejected() {
        let mut dict = DatasetDict::new().with_split(TRAIN_SPLIT, summarization_split(1));
        let err = resolve_validation(&mut dict, &config(None, None)).unwrap_err();
        assert!(matches!(err, TuneError::DatasetSplit { .. }));
    }

    #[tokio::test]
    async fn test_prepare_truncates_and_formats() {
        let service = FakeDatasetService::new(
            DatasetDict::new()
                .with_split(TRAIN_SPLIT, summarization_split(30))
                .with_split(VALIDATION_SPLIT, summarization_split(8)),
        );
        let preparer = DatasetPreparer::new(Arc::new(service));
        let prepared = preparer
            .prepare(&config(Some(10), Some(2)), &FakeTokenizer::new(), FamilyStrategy::Causal)
            .await
            .unwrap();
        assert_eq!(prepared.train.len(), 10);
        assert_eq!(prepared.validation.len(), 2);
        let PreparedSplit::Causal(examples) = &prepared.validation else {
            panic!("expected causal split");
        };
        // Truncation keeps the leading rows in order.
        assert!(examples[0].text.contains("article number 0"));
        assert!(examples[1].text.contains("article number 1"));
    }

    #[tokio::test]
    async fn test_prepare_caps_larger_than_split() {
        let service = FakeDatasetService::new(
            DatasetDict::new()
                .with_split(TRAIN_SPLIT, summarization_split(4))
                .with_split(TEST_SPLIT, summarization_split(1)),
        );
        let preparer = DatasetPreparer::new(Arc::new(service));
        let prepared = preparer
            .prepare(&config(Some(50), Some(50)), &FakeTokenizer::new(), FamilyStrategy::SeqToSeq)
            .await
            .unwrap();
        assert_eq!(prepared.train.len(), 4);
        assert_eq!(prepared.validation.len(), 1);
    }

    #[tokio::test]
    async fn test_prepare_missing_column_names_dataset() {
        let service = FakeDatasetService::new(
            DatasetDict::new()
                .with_split(TRAIN_SPLIT, summarization_split(4))
                .with_split(VALIDATION_SPLIT, summarization_split(2)),
        );
        let preparer = DatasetPreparer::new(Arc::new(service));
        let config = DatasetConfig {
            text_column: "document".to_string(),
            ..DatasetConfig::default()
        };
        let err = preparer
            .prepare(&config, &FakeTokenizer::new(), FamilyStrategy::Causal)
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::DatasetSplit { .. }));
        assert!(err.to_string().contains("document"));
    }
}
