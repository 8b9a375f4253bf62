//! Dataset services: load a named dataset as a set of named splits.

use crate::config::HubConfig;
use crate::data::split::{DataSplit, DatasetDict};
use crate::error::TuneError;
use crate::reference::DatasetReference;
use async_trait::async_trait;
use std::path::PathBuf;

/// Loads a dataset as named splits.
#[async_trait]
pub trait DatasetService: Send + Sync {
    async fn load(&self, reference: &DatasetReference) -> Result<DatasetDict, TuneError>;
}

// ---------------------------------------------------------------------------
// HubDatasetService
// ---------------------------------------------------------------------------

/// Hugging Face datasets-server client.
///
/// Lists the splits of the dataset's subset, then pages through `/rows` for each one.
pub struct HubDatasetService {
    client: reqwest::Client,
    config: HubConfig,
    token: Option<String>,
}

impl HubDatasetService {
    pub fn new(config: HubConfig) -> Self {
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.is_empty());
        Self {
            client: reqwest::Client::new(),
            config,
            token,
        }
    }

    fn subset(reference: &DatasetReference) -> &str {
        reference.subset().unwrap_or("default")
    }

    /// `<server>/<path>` with each query parameter percent-encoded.
    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<reqwest::Url, TuneError> {
        let server = self.config.datasets_server_url.trim_end_matches('/');
        let mut url = reqwest::Url::parse(&format!("{server}/{path}")).map_err(|e| {
            TuneError::Config(format!("invalid datasets server url '{server}': {e}"))
        })?;
        url.query_pairs_mut().extend_pairs(params);
        Ok(url)
    }

    fn splits_url(&self, reference: &DatasetReference) -> Result<reqwest::Url, TuneError> {
        let dataset = reference.dataset_id();
        self.endpoint("splits", &[("dataset", dataset.as_str())])
    }

    fn rows_url(
        &self,
        reference: &DatasetReference,
        split: &str,
        offset: usize,
        length: usize,
    ) -> Result<reqwest::Url, TuneError> {
        let dataset = reference.dataset_id();
        let offset = offset.to_string();
        let length = length.to_string();
        self.endpoint(
            "rows",
            &[
                ("dataset", dataset.as_str()),
                ("config", Self::subset(reference)),
                ("split", split),
                ("offset", offset.as_str()),
                ("length", length.as_str()),
            ],
        )
    }

    async fn get_json(&self, url: reqwest::Url) -> Result<serde_json::Value, TuneError> {
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TuneError::dataset(format!(
                "datasets server returned status {} for {url}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn split_names(&self, reference: &DatasetReference) -> Result<Vec<String>, TuneError> {
        let body = self.get_json(self.splits_url(reference)?).await?;
        parse_split_names(&body, Self::subset(reference))
    }

    async fn fetch_split(
        &self,
        reference: &DatasetReference,
        split: &str,
    ) -> Result<DataSplit, TuneError> {
        let page_size = self.config.page_size.max(1);
        let limit = self.config.fetch_limit;
        let mut records = Vec::new();
        let mut offset = 0;

        loop {
            let wanted = match limit {
                Some(max) if records.len() >= max => break,
                Some(max) => page_size.min(max - records.len()),
                None => page_size,
            };
            let body = self
                .get_json(self.rows_url(reference, split, offset, wanted)?)
                .await?;
            let (page, total) = parse_rows_page(&body)?;
            let fetched = page.len();
            records.extend(page);
            offset += fetched;
            tracing::debug!(split, offset, total, "Fetched rows page");

            if fetched == 0 || total.is_some_and(|t| offset >= t) {
                break;
            }
        }

        if let Some(max) = limit {
            records.truncate(max);
        }
        Ok(DataSplit::from_records(records))
    }
}

#[async_trait]
impl DatasetService for HubDatasetService {
    async fn load(&self, reference: &DatasetReference) -> Result<DatasetDict, TuneError> {
        let names = self.split_names(reference).await?;
        if names.is_empty() {
            return Err(TuneError::dataset(format!(
                "dataset '{reference}' has no splits for subset '{}'",
                Self::subset(reference)
            )));
        }

        let mut dict = DatasetDict::new();
        for name in names {
            let split = self.fetch_split(reference, &name).await?;
            tracing::info!(dataset = %reference, split = %name, rows = split.len(), "Loaded split");
            dict.insert(name, split);
        }
        Ok(dict)
    }
}

/// Split names for `subset` from a `/splits` response.
pub fn parse_split_names(body: &serde_json::Value, subset: &str) -> Result<Vec<String>, TuneError> {
    let entries = body
        .get("splits")
        .and_then(|v| v.as_array())
        .ok_or_else(|| TuneError::dataset("Unexpected /splits response format"))?;
    Ok(entries
        .iter()
        .filter(|e| e.get("config").and_then(|c| c.as_str()) == Some(subset))
        .filter_map(|e| e.get("split").and_then(|s| s.as_str()))
        .map(str::to_string)
        .collect())
}

/// Row objects and the server-reported total from a `/rows` response.
pub fn parse_rows_page(
    body: &serde_json::Value,
) -> Result<(Vec<serde_json::Value>, Option<usize>), TuneError> {
    // { "rows": [ { "row_idx": 0, "row": {...} }, ... ], "num_rows_total": N }
    let rows = body
        .get("rows")
        .and_then(|v| v.as_array())
        .ok_or_else(|| TuneError::dataset("Unexpected /rows response format"))?;
    let items = rows
        .iter()
        .filter_map(|entry| entry.get("row").cloned())
        .collect();
    let total = body
        .get("num_rows_total")
        .and_then(|v| v.as_u64())
        .map(|t| t as usize);
    Ok((items, total))
}

// ---------------------------------------------------------------------------
// JsonlDatasetService
// ---------------------------------------------------------------------------

/// Local dataset: every `<split>.jsonl` file in `dir` is one split.
pub struct JsonlDatasetService {
    pub dir: PathBuf,
}

impl JsonlDatasetService {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DatasetService for JsonlDatasetService {
    async fn load(&self, reference: &DatasetReference) -> Result<DatasetDict, TuneError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            TuneError::dataset(format!("cannot read {}: {e}", self.dir.display()))
        })?;

        let mut dict = DatasetDict::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let content = tokio::fs::read_to_string(&path).await?;
            let mut records = Vec::new();
            for (lineno, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
                    TuneError::dataset(format!("{}:{}: {e}", path.display(), lineno + 1))
                })?;
                records.push(value);
            }
            let split = DataSplit::from_records(records);
            tracing::debug!(dataset = %reference, split = name, rows = split.len(), "Loaded JSONL split");
            dict.insert(name, split);
        }

        if dict.is_empty() {
            return Err(TuneError::dataset(format!(
                "no .jsonl splits found in {}",
                self.dir.display()
            )));
        }
        Ok(dict)
    }
}
