//! Tokenized, family-formatted examples ready for a trainer.

use crate::family::selection::ModelFamily;
use serde::{Deserialize, Serialize};

/// Paired encoder input and decoder labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seq2SeqExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Target ids with padding positions replaced by the ignore label.
    pub labels: Vec<i64>,
}

/// Single formatted text; the instruction trainer tokenizes it itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalExample {
    pub text: String,
}

/// One prepared split. All examples share the family's format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", content = "examples", rename_all = "snake_case")]
pub enum PreparedSplit {
    SeqToSeq(Vec<Seq2SeqExample>),
    Causal(Vec<CausalExample>),
}

impl PreparedSplit {
    pub fn family(&self) -> ModelFamily {
        match self {
            Self::SeqToSeq(_) => ModelFamily::SeqToSeq,
            Self::Causal(_) => ModelFamily::Causal,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::SeqToSeq(examples) => examples.len(),
            Self::Causal(examples) => examples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Train and validation splits produced by the preparer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedDataset {
    pub train: PreparedSplit,
    pub validation: PreparedSplit,
}

impl PreparedDataset {
    pub fn family(&self) -> ModelFamily {
        self.train.family()
    }
}
