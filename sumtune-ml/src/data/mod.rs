//! Dataset loading, split resolution and family-specific preparation.

pub mod prepare;
pub mod prepared;
pub mod source;
pub mod split;

pub use prepare::{
    DEFAULT_TEST_FRACTION, DatasetPreparer, SPLIT_SEED, SplitResolution, resolve_validation,
    split_fraction,
};
pub use prepared::{CausalExample, PreparedDataset, PreparedSplit, Seq2SeqExample};
pub use source::{DatasetService, HubDatasetService, JsonlDatasetService};
pub use split::{DataSplit, DatasetDict};
