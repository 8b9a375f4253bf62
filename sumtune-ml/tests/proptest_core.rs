//! Property-based tests for core components using proptest.

use proptest::prelude::*;
use std::sync::Arc;

use sumtune_ml::config::DatasetConfig;
use sumtune_ml::data::split::test_split_size;
use sumtune_ml::data::prepare::split_fraction;
use sumtune_ml::data::{DatasetDict, DatasetPreparer};
use sumtune_ml::family::strategy::{IGNORE_LABEL, SUMMARY_START_MARKER};
use sumtune_ml::family::{extract_prompt, mask_pad_labels};
use sumtune_ml::testing::{FakeDatasetService, summarization_split};
use sumtune_ml::{DatasetReference, ModelReference, sanitize};

// --- Sanitization ---

proptest! {
    #[test]
    fn sanitize_is_idempotent(text in ".{0,64}") {
        let once = sanitize(&text);
        prop_assert_eq!(sanitize(&once), once.clone());
        prop_assert!(!once.contains("NaN"));
    }

    #[test]
    fn sanitize_keeps_text_without_nan(text in "[a-zA-Z0-9 .:]{0,64}") {
        prop_assume!(!text.contains("NaN"));
        prop_assert_eq!(sanitize(&text), text);
    }
}

// --- References ---

proptest! {
    #[test]
    fn model_reference_roundtrip(
        owner in "[a-z][a-z0-9-]{0,15}",
        repo in "[a-z][a-z0-9._-]{0,23}",
        commit in proptest::option::of("[0-9a-f]{40}"),
    ) {
        let mut reference = ModelReference::new(owner.clone(), repo.clone());
        if let Some(commit) = &commit {
            reference = reference.with_commit(commit.clone());
        }
        let parsed: ModelReference = reference.to_string().parse().unwrap();
        prop_assert_eq!(parsed.owner(), owner.as_str());
        prop_assert_eq!(parsed.repo(), repo.as_str());
        prop_assert_eq!(parsed.commit(), commit.as_deref());
        prop_assert_eq!(parsed, reference);
    }

    #[test]
    fn dataset_reference_roundtrip(
        owner in "[a-z][a-z0-9-]{0,15}",
        repo in "[a-z][a-z0-9_-]{0,23}",
        subset in proptest::option::of("[0-9][0-9.]{0,7}"),
    ) {
        let mut reference = DatasetReference::new(owner, repo);
        if let Some(subset) = subset {
            reference = reference.with_subset(subset);
        }
        let parsed: DatasetReference = reference.to_string().parse().unwrap();
        prop_assert_eq!(parsed, reference);
    }
}

// --- Split fraction and carving ---

proptest! {
    #[test]
    fn fraction_is_inside_unit_interval(train in 1usize..100_000, test in 1usize..100_000) {
        let fraction = split_fraction(Some(train), Some(test));
        prop_assert!(fraction > 0.0 && fraction < 1.0);
    }

    #[test]
    fn carve_partitions_train(rows in 10usize..200) {
        let dict = DatasetDict::new().with_split("train", summarization_split(rows));
        let preparer = DatasetPreparer::new(Arc::new(FakeDatasetService::new(dict)));
        let (train, validation) =
            tokio_test::block_on(preparer.raw_splits(&DatasetConfig::default())).unwrap();

        prop_assert_eq!(train.len() + validation.len(), rows);
        prop_assert_eq!(validation.len(), test_split_size(0.1, rows));
    }
}

// --- Formatting helpers ---

proptest! {
    #[test]
    fn masking_rewrites_only_pad_positions(
        ids in proptest::collection::vec(0u32..8, 0..64),
        pad in 0u32..8,
    ) {
        let labels = mask_pad_labels(&ids, pad);
        prop_assert_eq!(labels.len(), ids.len());
        for (id, label) in ids.iter().zip(&labels) {
            if *id == pad {
                prop_assert_eq!(*label, IGNORE_LABEL);
            } else {
                prop_assert_eq!(*label, i64::from(*id));
            }
        }
    }

    #[test]
    fn extracted_prompt_ends_at_marker(source in "[a-z ]{0,40}", summary in "[a-z ]{0,40}") {
        let text = format!("{source}. {SUMMARY_START_MARKER}{summary}");
        let prompt = extract_prompt(&text);
        prop_assert!(prompt.ends_with(SUMMARY_START_MARKER));
        prop_assert!(text.starts_with(&prompt));
        prop_assert_eq!(extract_prompt(&prompt), prompt.clone());
    }
}
