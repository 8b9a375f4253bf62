//! Model family registry: per-family loading and formatting policy.
//!
//! The registry is built once from static tables and checked for exhaustiveness over
//! [`ModelSelection::ALL`] and [`ModelFamily::ALL`] at construction. Lookups after that
//! cannot discover a gap.

use crate::error::TuneError;
use crate::family::selection::{ModelFamily, ModelSelection};
use crate::reference::ModelReference;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where the tokenizer's padding token comes from when the model ships without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadTokenSource {
    /// Reuse the end-of-sequence token.
    EosToken,
}

/// Weight quantization applied when loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuantizationConfig {
    BitsAndBytes { bits: u8, double_quant: bool },
}

impl QuantizationConfig {
    pub fn int8() -> Self {
        Self::BitsAndBytes {
            bits: 8,
            double_quant: false,
        }
    }
}

/// Device placement strategy for the loaded weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePlacement {
    /// Let the runtime spread layers across available devices.
    Auto,
    /// No device map; the training engine places the model itself.
    Unset,
}

/// Loading and formatting policy for one model family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProperties {
    pub family: ModelFamily,
    pub pad_token: Option<PadTokenSource>,
    pub quantization: Option<QuantizationConfig>,
    pub device_placement: DevicePlacement,
    pub trust_remote_code: bool,
}

impl ModelProperties {
    fn seq_to_seq() -> Self {
        Self {
            family: ModelFamily::SeqToSeq,
            pad_token: None,
            quantization: None,
            device_placement: DevicePlacement::Auto,
            trust_remote_code: false,
        }
    }

    fn causal() -> Self {
        Self {
            family: ModelFamily::Causal,
            pad_token: Some(PadTokenSource::EosToken),
            quantization: Some(QuantizationConfig::int8()),
            device_placement: DevicePlacement::Unset,
            trust_remote_code: true,
        }
    }
}

const SELECTION_TABLE: [(ModelSelection, ModelFamily); 8] = [
    (ModelSelection::FlanSmall, ModelFamily::SeqToSeq),
    (ModelSelection::FlanBase, ModelFamily::SeqToSeq),
    (ModelSelection::FlanLarge, ModelFamily::SeqToSeq),
    (ModelSelection::FlanXl, ModelFamily::SeqToSeq),
    (ModelSelection::FlanXxl, ModelFamily::SeqToSeq),
    (ModelSelection::GptJ6b, ModelFamily::Causal),
    (ModelSelection::Falcon7b, ModelFamily::Causal),
    (ModelSelection::Falcon7bInstruct, ModelFamily::Causal),
];

/// Immutable selection → family → policy lookup.
#[derive(Debug, Clone)]
pub struct FamilyRegistry {
    families: HashMap<ModelSelection, ModelFamily>,
    properties: HashMap<ModelFamily, ModelProperties>,
}

impl FamilyRegistry {
    /// The built-in policy table.
    pub fn builtin() -> Result<Self, TuneError> {
        Self::from_entries(
            SELECTION_TABLE,
            [ModelProperties::seq_to_seq(), ModelProperties::causal()],
        )
    }

    /// Build a registry, failing unless every selection and every family has an entry
    /// and each selection maps to the family its name implies.
    pub fn from_entries(
        selections: impl IntoIterator<Item = (ModelSelection, ModelFamily)>,
        properties: impl IntoIterator<Item = ModelProperties>,
    ) -> Result<Self, TuneError> {
        let families: HashMap<_, _> = selections.into_iter().collect();
        let properties: HashMap<_, _> = properties.into_iter().map(|p| (p.family, p)).collect();

        for selection in ModelSelection::ALL {
            let Some(&family) = families.get(&selection) else {
                return Err(TuneError::unknown_selection(
                    selection.as_str(),
                    "no family registered for selection",
                ));
            };
            if family != selection.naming_family() {
                return Err(TuneError::unknown_selection(
                    selection.as_str(),
                    format!(
                        "registered as {family} but its reference names a {} model",
                        selection.naming_family()
                    ),
                ));
            }
        }
        for family in ModelFamily::ALL {
            if !properties.contains_key(&family) {
                return Err(TuneError::unknown_selection(
                    family.as_str(),
                    "no properties registered for family",
                ));
            }
        }

        tracing::debug!(
            selections = families.len(),
            families = properties.len(),
            "Model family registry initialised"
        );
        Ok(Self {
            families,
            properties,
        })
    }

    /// Map a selection to its canonical reference and family.
    pub fn resolve(
        &self,
        selection: ModelSelection,
    ) -> Result<(ModelReference, ModelFamily), TuneError> {
        let family = self.family(selection)?;
        Ok((selection.reference(), family))
    }

    pub fn family(&self, selection: ModelSelection) -> Result<ModelFamily, TuneError> {
        self.families.get(&selection).copied().ok_or_else(|| {
            TuneError::unknown_selection(selection.as_str(), "selection is not registered")
        })
    }

    pub fn properties(&self, family: ModelFamily) -> Result<&ModelProperties, TuneError> {
        self.properties.get(&family).ok_or_else(|| {
            TuneError::unknown_selection(family.as_str(), "family has no registered properties")
        })
    }

    /// Policy for the model behind `reference`, derived through its selection.
    pub fn properties_for_reference(
        &self,
        reference: &ModelReference,
    ) -> Result<&ModelProperties, TuneError> {
        let selection = ModelSelection::from_reference(reference)?;
        self.properties(self.family(selection)?)
    }
}
