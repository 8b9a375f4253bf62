//! Model selections, the family policy registry and per-family strategies.

pub mod registry;
pub mod selection;
pub mod strategy;

pub use registry::{
    DevicePlacement, FamilyRegistry, ModelProperties, PadTokenSource, QuantizationConfig,
};
pub use selection::{ModelFamily, ModelSelection};
pub use strategy::{EvalPrompt, FamilyStrategy, extract_prompt, mask_pad_labels};
