//! Model and dataset references in their canonical string forms.
//!
//! Models: `owner/repo[@commit]`. Datasets: `owner/repo[:subset]`.

use crate::error::TuneError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies a pretrained model in a remote repository.
///
/// A reference carrying a commit denotes an exact, reproducible snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelReference {
    owner: String,
    repo: String,
    commit: Option<String>,
}

impl ModelReference {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            commit: None,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn commit(&self) -> Option<&str> {
        self.commit.as_deref()
    }

    /// `owner/repo` without the commit suffix.
    pub fn repo_id(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Same owner and repository pinned to `commit`.
    pub fn with_commit(&self, commit: impl Into<String>) -> Self {
        Self {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            commit: Some(commit.into()),
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.commit.is_some()
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.commit {
            Some(commit) => write!(f, "{}/{}@{commit}", self.owner, self.repo),
            None => write!(f, "{}/{}", self.owner, self.repo),
        }
    }
}

impl FromStr for ModelReference {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, commit) = match s.split_once('@') {
            Some((path, commit)) => {
                if commit.is_empty() {
                    return Err(TuneError::invalid_input(format!(
                        "model reference '{s}' has an empty commit"
                    )));
                }
                (path, Some(commit.to_string()))
            }
            None => (s, None),
        };
        let (owner, repo) = split_owner_repo(path, s)?;
        Ok(Self {
            owner,
            repo,
            commit,
        })
    }
}

impl TryFrom<String> for ModelReference {
    type Error = TuneError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelReference> for String {
    fn from(value: ModelReference) -> Self {
        value.to_string()
    }
}

/// Identifies a dataset, optionally narrowed to a named subset (configuration).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetReference {
    owner: String,
    repo: String,
    subset: Option<String>,
}

impl DatasetReference {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            subset: None,
        }
    }

    pub fn with_subset(mut self, subset: impl Into<String>) -> Self {
        self.subset = Some(subset.into());
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn subset(&self) -> Option<&str> {
        self.subset.as_deref()
    }

    /// `owner/repo` as understood by dataset hubs.
    pub fn dataset_id(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for DatasetReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subset {
            Some(subset) => write!(f, "{}/{}:{subset}", self.owner, self.repo),
            None => write!(f, "{}/{}", self.owner, self.repo),
        }
    }
}

impl FromStr for DatasetReference {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, subset) = match s.split_once(':') {
            Some((path, subset)) if !subset.is_empty() => (path, Some(subset.to_string())),
            Some(_) => {
                return Err(TuneError::invalid_input(format!(
                    "dataset reference '{s}' has an empty subset"
                )));
            }
            None => (s, None),
        };
        let (owner, repo) = split_owner_repo(path, s)?;
        Ok(Self {
            owner,
            repo,
            subset,
        })
    }
}

impl TryFrom<String> for DatasetReference {
    type Error = TuneError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetReference> for String {
    fn from(value: DatasetReference) -> Self {
        value.to_string()
    }
}

fn split_owner_repo(path: &str, original: &str) -> Result<(String, String), TuneError> {
    match path.split_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(TuneError::invalid_input(format!(
            "reference '{original}' must have the form owner/repo"
        ))),
    }
}
