//! Hugging Face tokenizers fetched from the model hub.

use crate::backend::{Padding, TokenBatch, Tokenizer, TokenizerSource};
use crate::error::TuneError;
use crate::reference::ModelReference;
use async_trait::async_trait;
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use tokenizers::{PaddingParams, PaddingStrategy, TruncationParams};

const EOS_CANDIDATES: [&str; 3] = ["</s>", "<|endoftext|>", "<eos>"];
const PAD_CANDIDATES: [&str; 1] = ["<pad>"];

/// `tokenizers` tokenizer plus the special tokens the pipeline relies on.
pub struct HubTokenizer {
    inner: tokenizers::Tokenizer,
    pad: Option<(String, u32)>,
    eos: Option<String>,
}

impl HubTokenizer {
    /// Load `tokenizer.json`, reading special tokens from `tokenizer_config.json` when given.
    pub fn from_files(tokenizer_file: &Path, config_file: Option<&Path>) -> Result<Self, TuneError> {
        let inner = tokenizers::Tokenizer::from_file(tokenizer_file).map_err(|e| {
            TuneError::tokenizer(format!(
                "failed to load {}: {e}",
                tokenizer_file.display()
            ))
        })?;
        let config = match config_file {
            Some(path) => Some(serde_json::from_str::<serde_json::Value>(
                &std::fs::read_to_string(path)?,
            )?),
            None => None,
        };
        Ok(Self::from_tokenizer(inner, config.as_ref()))
    }

    pub fn from_tokenizer(
        inner: tokenizers::Tokenizer,
        config: Option<&serde_json::Value>,
    ) -> Self {
        let configured = |key: &str| config.and_then(|c| special_token(c, key));

        let eos = configured("eos_token")
            .or_else(|| first_known(&inner, &EOS_CANDIDATES))
            .filter(|t| inner.token_to_id(t).is_some());

        let pad = inner
            .get_padding()
            .map(|p| (p.pad_token.clone(), p.pad_id))
            .or_else(|| {
                configured("pad_token")
                    .or_else(|| first_known(&inner, &PAD_CANDIDATES))
                    .and_then(|t| inner.token_to_id(&t).map(|id| (t, id)))
            });

        Self { inner, pad, eos }
    }
}

/// `"</s>"` or `{"content": "</s>", ...}` under `key`.
fn special_token(config: &serde_json::Value, key: &str) -> Option<String> {
    match config.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}

fn first_known(inner: &tokenizers::Tokenizer, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find(|t| inner.token_to_id(t).is_some())
        .map(|t| t.to_string())
}

impl Tokenizer for HubTokenizer {
    fn encode(
        &self,
        texts: &[String],
        max_length: Option<usize>,
        padding: Padding,
        truncate: bool,
    ) -> Result<TokenBatch, TuneError> {
        let mut tokenizer = self.inner.clone();

        let padding = match (padding, max_length) {
            (Padding::MaxLength, Some(max)) => {
                let (pad_token, pad_id) = self.pad.clone().ok_or_else(|| {
                    TuneError::tokenizer("padding requested but the tokenizer has no pad token")
                })?;
                Some(PaddingParams {
                    strategy: PaddingStrategy::Fixed(max),
                    pad_id,
                    pad_token,
                    ..Default::default()
                })
            }
            _ => None,
        };
        tokenizer.with_padding(padding);

        let truncation = match (truncate, max_length) {
            (true, Some(max)) => Some(TruncationParams {
                max_length: max,
                ..Default::default()
            }),
            _ => None,
        };
        tokenizer
            .with_truncation(truncation)
            .map_err(|e| TuneError::tokenizer(format!("failed to set truncation: {e}")))?;

        let encodings = tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| TuneError::tokenizer(format!("batch tokenization failed: {e}")))?;

        let mut batch = TokenBatch::default();
        for encoding in encodings {
            batch.input_ids.push(encoding.get_ids().to_vec());
            batch
                .attention_mask
                .push(encoding.get_attention_mask().to_vec());
        }
        Ok(batch)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TuneError> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| TuneError::tokenizer(format!("decoding failed: {e}")))
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad.as_ref().map(|(_, id)| *id)
    }

    fn eos_token(&self) -> Option<String> {
        self.eos.clone()
    }

    fn set_pad_token(&mut self, token: &str) -> Result<(), TuneError> {
        let id = self.inner.token_to_id(token).ok_or_else(|| {
            TuneError::tokenizer(format!("'{token}' is not in the vocabulary"))
        })?;
        self.pad = Some((token.to_string(), id));
        Ok(())
    }
}

/// Downloads tokenizer files through the hub cache.
#[derive(Debug, Clone, Default)]
pub struct HubTokenizerSource {
    token: Option<String>,
    cache_dir: Option<PathBuf>,
}

impl HubTokenizerSource {
    /// Read the access token from `token_env`, if set.
    pub fn from_env(token_env: &str) -> Self {
        Self {
            token: std::env::var(token_env).ok().filter(|t| !t.is_empty()),
            cache_dir: None,
        }
    }

    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    fn fetch(
        token: Option<String>,
        cache_dir: Option<PathBuf>,
        reference: &ModelReference,
    ) -> Result<(PathBuf, Option<PathBuf>), TuneError> {
        let mut builder = ApiBuilder::new().with_token(token);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir);
        }
        let api = builder
            .build()
            .map_err(|e| TuneError::model_load(reference, format!("hub client: {e}")))?;
        let repo = match reference.commit() {
            Some(commit) => Repo::with_revision(reference.repo_id(), RepoType::Model, commit.to_string()),
            None => Repo::model(reference.repo_id()),
        };
        let repo = api.repo(repo);
        let tokenizer_file = repo
            .get("tokenizer.json")
            .map_err(|e| TuneError::model_load(reference, format!("tokenizer.json: {e}")))?;
        let config_file = repo.get("tokenizer_config.json").ok();
        Ok((tokenizer_file, config_file))
    }
}

#[async_trait]
impl TokenizerSource for HubTokenizerSource {
    async fn load_tokenizer(
        &self,
        reference: &ModelReference,
    ) -> Result<Box<dyn Tokenizer>, TuneError> {
        let token = self.token.clone();
        let cache_dir = self.cache_dir.clone();
        let owned = reference.clone();
        let (tokenizer_file, config_file) =
            tokio::task::spawn_blocking(move || Self::fetch(token, cache_dir, &owned))
                .await
                .map_err(|e| TuneError::model_load(reference, format!("download task: {e}")))??;

        let tokenizer = HubTokenizer::from_files(&tokenizer_file, config_file.as_deref())?;
        tracing::info!(
            model = %reference,
            pad = ?tokenizer.pad_token_id(),
            eos = ?tokenizer.eos,
            "Loaded tokenizer"
        );
        Ok(Box::new(tokenizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    fn word_level(words: &[&str]) -> tokenizers::Tokenizer {
        let vocab: HashMap<String, u32> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab.into_iter().collect())
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        let mut tokenizer = tokenizers::Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        tokenizer
    }

    #[test]
    fn test_special_tokens_from_config() {
        let inner = word_level(&["<pad>", "</s>", "<unk>", "hello", "world"]);
        let config = serde_json::json!({
            "eos_token": {"content": "</s>", "special": true},
            "pad_token": "<pad>"
        });
        let tok = HubTokenizer::from_tokenizer(inner, Some(&config));
        assert_eq!(tok.pad_token_id(), Some(0));
        assert_eq!(tok.eos_token().as_deref(), Some("</s>"));
    }

    #[test]
    fn test_causal_vocab_has_no_pad() {
        let inner = word_level(&["<|endoftext|>", "<unk>", "hello"]);
        let mut tok = HubTokenizer::from_tokenizer(inner, None);
        assert_eq!(tok.pad_token_id(), None);
        assert_eq!(tok.eos_token().as_deref(), Some("<|endoftext|>"));

        let eos = tok.eos_token().unwrap();
        tok.set_pad_token(&eos).unwrap();
        assert_eq!(tok.pad_token_id(), Some(0));
    }

    #[test]
    fn test_fixed_padding_and_truncation() {
        let inner = word_level(&["<pad>", "</s>", "<unk>", "a", "b", "c"]);
        let tok = HubTokenizer::from_tokenizer(inner, None);
        let batch = tok
            .encode(
                &["a b".to_string(), "a b c a b c".to_string()],
                Some(4),
                Padding::MaxLength,
                true,
            )
            .unwrap();
        assert_eq!(batch.input_ids[0], vec![3, 4, 0, 0]);
        assert_eq!(batch.attention_mask[0], vec![1, 1, 0, 0]);
        assert_eq!(batch.input_ids[1], vec![3, 4, 5, 3]);

        let unpadded = tok
            .encode(&["c a".to_string()], None, Padding::None, false)
            .unwrap();
        assert_eq!(unpadded.input_ids[0], vec![5, 3]);
        assert_eq!(tok.decode(&[3, 4, 0, 0], true).unwrap(), "a b <pad> <pad>");
    }
}
