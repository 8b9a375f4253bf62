//! Generation-based evaluation over a validation split.

use crate::backend::{ExecutionMode, Generator, Tokenizer};
use crate::data::PreparedSplit;
use crate::error::TuneError;
use crate::family::strategy::FamilyStrategy;
use crate::training::trained::TrainedModel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Replace every literal `NaN` with `?`.
pub fn sanitize(text: &str) -> String {
    text.replace("NaN", "?")
}

/// One validation prompt and the model's continuation, both sanitized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptResponse {
    pub prompt: String,
    pub response: String,
}

impl PromptResponse {
    pub fn new(prompt: &str, response: &str) -> Self {
        Self {
            prompt: sanitize(prompt),
            response: sanitize(response),
        }
    }
}

/// Responses in validation-split order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub continuations: Vec<PromptResponse>,
}

impl EvaluationResults {
    pub fn len(&self) -> usize {
        self.continuations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.continuations.is_empty()
    }
}

pub struct Evaluator {
    generator: Arc<dyn Generator>,
    max_new_tokens: usize,
}

impl Evaluator {
    pub fn new(generator: Arc<dyn Generator>, max_new_tokens: usize) -> Self {
        Self {
            generator,
            max_new_tokens,
        }
    }

    /// Generate a continuation for every validation example, one at a time.
    ///
    /// Switches the model to inference with the key-value cache on. The first failure
    /// aborts the run with the index of the example that failed.
    pub async fn evaluate(
        &self,
        trained: &mut TrainedModel,
        validation: &PreparedSplit,
        tokenizer: &dyn Tokenizer,
        strategy: FamilyStrategy,
    ) -> Result<EvaluationResults, TuneError> {
        trained.model.flags.mode = ExecutionMode::Inference;
        trained.model.flags.use_cache = true;

        let mut results = EvaluationResults::default();
        for index in 0..validation.len() {
            let prompt = strategy
                .eval_prompt(validation, index, tokenizer)
                .map_err(|e| at_example(index, e))?;
            let continuation = self
                .generator
                .generate(&trained.model, &prompt.input, self.max_new_tokens)
                .await
                .map_err(|e| at_example(index, e))?;
            let response = tokenizer
                .decode(&continuation, true)
                .map_err(|e| at_example(index, e))?;
            tracing::debug!(index, tokens = continuation.len(), "Generated continuation");
            results
                .continuations
                .push(PromptResponse::new(&prompt.text, &response));
        }

        tracing::info!(examples = results.len(), "Evaluation finished");
        Ok(results)
    }
}

/// Attach the failing example's position, keeping a generator's own message as is.
fn at_example(index: usize, err: TuneError) -> TuneError {
    match err {
        TuneError::Generation { message, .. } => TuneError::generation(index, message),
        other => TuneError::generation(index, other.to_string()),
    }
}
