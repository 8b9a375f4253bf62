//! Model selections and the families they belong to.

use crate::error::TuneError;
use crate::reference::ModelReference;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const FLAN_PREFIX: &str = "flan_";
const FLAN_REPO_PREFIX: &str = "flan-t5-";
const FLAN_OWNER: &str = "google";
const CAUSAL_OWNER: &str = "tiiuae";

/// Architecture family of a pretrained model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// Encoder-decoder models trained on paired input/label tensors.
    SeqToSeq,
    /// Decoder-only models trained on a single formatted text field.
    Causal,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 2] = [ModelFamily::SeqToSeq, ModelFamily::Causal];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SeqToSeq => "seq_to_seq",
            Self::Causal => "causal",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named model variants that can be fine-tuned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelSelection {
    #[serde(rename = "flan_small")]
    FlanSmall,
    #[serde(rename = "flan_base")]
    FlanBase,
    #[serde(rename = "flan_large")]
    FlanLarge,
    #[serde(rename = "flan_xl")]
    FlanXl,
    #[serde(rename = "flan_xxl")]
    FlanXxl,
    #[serde(rename = "gpt_j_6b")]
    GptJ6b,
    #[serde(rename = "falcon_7b")]
    Falcon7b,
    #[serde(rename = "falcon_7b_instruct")]
    Falcon7bInstruct,
}

impl ModelSelection {
    /// Every selection, in declaration order. `ordinal` keeps this list in sync with the enum.
    pub const ALL: [ModelSelection; 8] = [
        ModelSelection::FlanSmall,
        ModelSelection::FlanBase,
        ModelSelection::FlanLarge,
        ModelSelection::FlanXl,
        ModelSelection::FlanXxl,
        ModelSelection::GptJ6b,
        ModelSelection::Falcon7b,
        ModelSelection::Falcon7bInstruct,
    ];

    /// Position in [`ModelSelection::ALL`]. Adding a variant without listing it fails to compile here.
    pub const fn ordinal(self) -> usize {
        match self {
            Self::FlanSmall => 0,
            Self::FlanBase => 1,
            Self::FlanLarge => 2,
            Self::FlanXl => 3,
            Self::FlanXxl => 4,
            Self::GptJ6b => 5,
            Self::Falcon7b => 6,
            Self::Falcon7bInstruct => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FlanSmall => "flan_small",
            Self::FlanBase => "flan_base",
            Self::FlanLarge => "flan_large",
            Self::FlanXl => "flan_xl",
            Self::FlanXxl => "flan_xxl",
            Self::GptJ6b => "gpt_j_6b",
            Self::Falcon7b => "falcon_7b",
            Self::Falcon7bInstruct => "falcon_7b_instruct",
        }
    }

    pub fn is_flan(self) -> bool {
        self.as_str().starts_with(FLAN_PREFIX)
    }

    /// Family implied by the naming convention alone.
    pub fn naming_family(self) -> ModelFamily {
        if self.is_flan() {
            ModelFamily::SeqToSeq
        } else {
            ModelFamily::Causal
        }
    }

    /// Canonical repository reference derived from the selection name.
    pub fn reference(self) -> ModelReference {
        let name = self.as_str();
        if self.is_flan() {
            let size = name.replace(FLAN_PREFIX, "");
            ModelReference::new(FLAN_OWNER, format!("{FLAN_REPO_PREFIX}{size}"))
        } else {
            ModelReference::new(CAUSAL_OWNER, name.replace('_', "-"))
        }
    }

    /// Inverse of [`ModelSelection::reference`], ignoring owner and commit.
    pub fn from_reference(reference: &ModelReference) -> Result<Self, TuneError> {
        let repo = reference.repo();
        let name = if repo.contains("flan") {
            repo.replace(FLAN_REPO_PREFIX, FLAN_PREFIX)
        } else {
            repo.replace('-', "_")
        };
        name.parse().map_err(|_| {
            TuneError::unknown_selection(
                reference.to_string(),
                "repository does not correspond to a known model selection",
            )
        })
    }
}

impl fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelSelection {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|sel| sel.as_str() == s)
            .ok_or_else(|| TuneError::unknown_selection(s, "not a known model selection"))
    }
}
