//! Per-family behaviour: prompt formatting, label construction and evaluation prompts.
//!
//! A [`FamilyStrategy`] is resolved once per run and passed to every stage, so the
//! family branch lives here instead of being re-derived by each component.

use crate::backend::{GenerationInput, Padding, Tokenizer};
use crate::config::{AdapterConfig, AdapterTask, DatasetConfig};
use crate::data::{CausalExample, DataSplit, PreparedSplit, Seq2SeqExample};
use crate::error::TuneError;
use crate::family::selection::ModelFamily;

pub const SUMMARIZE_PREFIX: &str = "**Please summarize**";
pub const SUMMARY_START_MARKER: &str = "**Summary**: ";
pub const END_MARKER: &str = "**End**";

/// Label value the loss function skips.
pub const IGNORE_LABEL: i64 = -100;

/// Field the instruction trainer reads causal examples from.
pub const TEXT_FIELD: &str = "text";

const FORMAT_BATCH_SIZE: usize = 1000;

/// Encoder input for a sequence-to-sequence example.
pub fn seq_to_seq_prompt(source: &str) -> String {
    format!("{SUMMARIZE_PREFIX}: {source}. {SUMMARY_START_MARKER}")
}

/// Full training text for a causal example.
pub fn causal_text(source: &str, summary: &str) -> String {
    format!("{SUMMARIZE_PREFIX}: {source}. {SUMMARY_START_MARKER}{summary} {END_MARKER}")
}

/// Replace padding positions with [`IGNORE_LABEL`]; every other id is kept as is.
pub fn mask_pad_labels(ids: &[u32], pad_id: u32) -> Vec<i64> {
    ids.iter()
        .map(|&id| {
            if id == pad_id {
                IGNORE_LABEL
            } else {
                i64::from(id)
            }
        })
        .collect()
}

/// Reduce causal training text to the prompt the model should continue.
///
/// Keeps everything up to and including the first summary marker. Text without the
/// marker is treated as an unterminated prompt and gets the marker appended.
pub fn extract_prompt(text: &str) -> String {
    match text.find(SUMMARY_START_MARKER) {
        Some(start) => text[..start + SUMMARY_START_MARKER.len()].to_string(),
        None => {
            tracing::warn!(
                chars = text.len(),
                "Summary marker missing from eval text, treating it as a bare prompt"
            );
            format!("{text} {SUMMARY_START_MARKER}")
        }
    }
}

/// A validation example turned into generation input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalPrompt {
    /// Prompt text as recorded in the results.
    pub text: String,
    pub input: GenerationInput,
}

/// Family-specific behaviour shared by the preparer, engine and evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyStrategy {
    SeqToSeq,
    Causal,
}

impl FamilyStrategy {
    pub fn for_family(family: ModelFamily) -> Self {
        match family {
            ModelFamily::SeqToSeq => Self::SeqToSeq,
            ModelFamily::Causal => Self::Causal,
        }
    }

    pub fn family(self) -> ModelFamily {
        match self {
            Self::SeqToSeq => ModelFamily::SeqToSeq,
            Self::Causal => ModelFamily::Causal,
        }
    }

    /// Whether the trainer for this family only exposes its adapted model at save events.
    pub fn captures_checkpoint(self) -> bool {
        matches!(self, Self::Causal)
    }

    /// Adapter config with the task type this family trains under.
    pub fn adapter_config(self, adapter: &AdapterConfig) -> AdapterConfig {
        AdapterConfig {
            task_type: Some(AdapterTask::for_family(self.family())),
            ..adapter.clone()
        }
    }

    /// Format and tokenize a raw split, dropping every raw column.
    ///
    /// Runs batch by batch and is never cached.
    pub fn format_split(
        self,
        split: &DataSplit,
        tokenizer: &dyn Tokenizer,
        config: &DatasetConfig,
    ) -> Result<PreparedSplit, TuneError> {
        let sources = split.string_column(&config.text_column)?;
        let summaries = split.string_column(&config.summary_column)?;

        match self {
            Self::SeqToSeq => {
                let pad_id = tokenizer.pad_token_id().ok_or_else(|| {
                    TuneError::tokenizer("tokenizer has no padding token; labels cannot be masked")
                })?;
                let mut examples = Vec::with_capacity(sources.len());
                for (batch, (src, tgt)) in sources
                    .chunks(FORMAT_BATCH_SIZE)
                    .zip(summaries.chunks(FORMAT_BATCH_SIZE))
                    .enumerate()
                {
                    let inputs: Vec<String> = src.iter().map(|s| seq_to_seq_prompt(s)).collect();
                    let model_inputs = tokenizer.encode(
                        &inputs,
                        Some(config.max_input_length),
                        Padding::MaxLength,
                        true,
                    )?;
                    let targets = tokenizer.encode(
                        tgt,
                        Some(config.max_output_length),
                        Padding::MaxLength,
                        true,
                    )?;
                    if model_inputs.input_ids.len() != inputs.len()
                        || targets.input_ids.len() != inputs.len()
                    {
                        return Err(TuneError::tokenizer(format!(
                            "batch {batch}: tokenizer returned a mismatched number of sequences"
                        )));
                    }
                    for ((input_ids, attention_mask), label_ids) in model_inputs
                        .input_ids
                        .into_iter()
                        .zip(model_inputs.attention_mask)
                        .zip(targets.input_ids)
                    {
                        examples.push(Seq2SeqExample {
                            input_ids,
                            attention_mask,
                            labels: mask_pad_labels(&label_ids, pad_id),
                        });
                    }
                    tracing::debug!(batch, rows = src.len(), "Tokenized seq2seq batch");
                }
                Ok(PreparedSplit::SeqToSeq(examples))
            }
            Self::Causal => {
                let examples = sources
                    .iter()
                    .zip(&summaries)
                    .map(|(src, summary)| CausalExample {
                        text: causal_text(src, summary),
                    })
                    .collect();
                Ok(PreparedSplit::Causal(examples))
            }
        }
    }

    /// Build the generation input for validation example `index`.
    pub fn eval_prompt(
        self,
        split: &PreparedSplit,
        index: usize,
        tokenizer: &dyn Tokenizer,
    ) -> Result<EvalPrompt, TuneError> {
        match (self, split) {
            (Self::SeqToSeq, PreparedSplit::SeqToSeq(examples)) => {
                let example = examples.get(index).ok_or_else(|| out_of_range(index))?;
                let text = tokenizer.decode(&example.input_ids, true)?;
                Ok(EvalPrompt {
                    text,
                    input: GenerationInput {
                        input_ids: example.input_ids.clone(),
                        attention_mask: Some(example.attention_mask.clone()),
                    },
                })
            }
            (Self::Causal, PreparedSplit::Causal(examples)) => {
                let example = examples.get(index).ok_or_else(|| out_of_range(index))?;
                let text = extract_prompt(&example.text);
                let encoded = tokenizer.encode(
                    std::slice::from_ref(&text),
                    None,
                    Padding::None,
                    false,
                )?;
                let input_ids = encoded
                    .input_ids
                    .into_iter()
                    .next()
                    .ok_or_else(|| TuneError::tokenizer("tokenizer returned no sequence"))?;
                Ok(EvalPrompt {
                    text,
                    input: GenerationInput {
                        input_ids,
                        attention_mask: None,
                    },
                })
            }
            (strategy, split) => Err(TuneError::invalid_input(format!(
                "{} split cannot be evaluated with the {} strategy",
                split.family(),
                strategy.family()
            ))),
        }
    }
}

fn out_of_range(index: usize) -> TuneError {
    TuneError::invalid_input(format!("validation example {index} does not exist"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTokenizer;
    use serde_json::json;

    #[test]
    fn test_mask_pad_labels_only_touches_pad() {
        let ids = [17, 4, 0, 0, 9, 0];
        let labels = mask_pad_labels(&ids, 0);
        assert_eq!(labels, vec![17, 4, -100, -100, 9, -100]);
    }

    #[test]
    fn test_extract_prompt_with_marker() {
        let text = causal_text("the article", "the summary");
        assert_eq!(
            extract_prompt(&text),
            "**Please summarize**: the article. **Summary**: "
        );
    }

    #[test]
    fn test_extract_prompt_uses_first_marker() {
        let text = "a **Summary**: b **Summary**: c";
        assert_eq!(extract_prompt(text), "a **Summary**: ");
    }

    #[test]
    fn test_extract_prompt_without_marker() {
        assert_eq!(
            extract_prompt("just an article"),
            "just an article **Summary**: "
        );
    }

    #[test]
    fn test_seq_to_seq_format_split() {
        let split = DataSplit::from_records(vec![
            json!({"article": "alpha beta", "highlights": "ab"}),
            json!({"article": "gamma", "highlights": "g"}),
        ]);
        let config = DatasetConfig {
            max_input_length: 16,
            max_output_length: 4,
            ..DatasetConfig::default()
        };
        let tokenizer = FakeTokenizer::new();
        let prepared = FamilyStrategy::SeqToSeq
            .format_split(&split, &tokenizer, &config)
            .unwrap();
        let PreparedSplit::SeqToSeq(examples) = prepared else {
            panic!("expected seq2seq split");
        };
        assert_eq!(examples.len(), 2);
        for ex in &examples {
            assert_eq!(ex.input_ids.len(), 16);
            assert_eq!(ex.attention_mask.len(), 16);
            assert_eq!(ex.labels.len(), 4);
        }
        // "g" is one token, the remaining three label positions were padding.
        assert_eq!(&examples[1].labels[1..], &[-100, -100, -100]);
        assert_ne!(examples[1].labels[0], IGNORE_LABEL);
    }

    #[test]
    fn test_causal_format_split() {
        let split = DataSplit::from_records(vec![json!({"article": "x", "highlights": "y"})]);
        let prepared = FamilyStrategy::Causal
            .format_split(&split, &FakeTokenizer::new(), &DatasetConfig::default())
            .unwrap();
        assert_eq!(
            prepared,
            PreparedSplit::Causal(vec![CausalExample {
                text: "**Please summarize**: x. **Summary**: y **End**".to_string()
            }])
        );
    }

    #[test]
    fn test_missing_column_is_split_error() {
        let split = DataSplit::from_records(vec![json!({"document": "x", "summary": "y"})]);
        let err = FamilyStrategy::Causal
            .format_split(&split, &FakeTokenizer::new(), &DatasetConfig::default())
            .unwrap_err();
        assert!(matches!(err, TuneError::Dataset(_)));
    }

    #[test]
    fn test_seq_to_seq_requires_pad_token() {
        let split = DataSplit::from_records(vec![json!({"article": "x", "highlights": "y"})]);
        let tokenizer = FakeTokenizer::without_pad();
        let err = FamilyStrategy::SeqToSeq
            .format_split(&split, &tokenizer, &DatasetConfig::default())
            .unwrap_err();
        assert!(matches!(err, TuneError::Tokenizer(_)));
    }

    #[test]
    fn test_eval_prompt_mismatched_split() {
        let split = PreparedSplit::Causal(vec![]);
        let err = FamilyStrategy::SeqToSeq
            .eval_prompt(&split, 0, &FakeTokenizer::new())
            .unwrap_err();
        assert!(matches!(err, TuneError::InvalidInput(_)));
    }

    #[test]
    fn test_adapter_config_sets_task() {
        let adapter = FamilyStrategy::Causal.adapter_config(&AdapterConfig::default());
        assert_eq!(adapter.task_type, Some(AdapterTask::CausalLm));
        assert_eq!(adapter.rank, AdapterConfig::default().rank);
    }
}
