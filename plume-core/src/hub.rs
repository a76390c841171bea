//! Hugging Face hub access: adapter downloads and base-weight cache lookups.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hf_hub::{api::tokio::ApiBuilder, Cache, Repo, RepoType};
use secrecy::{ExposeSecret, SecretString};

use crate::AdapterId;

/// Resolves an adapter to a local weight file, downloading it if needed.
#[async_trait]
pub trait AdapterFetcher: Send + Sync {
    /// `token` authenticates this one fetch and is not kept afterwards.
    async fn fetch(&self, adapter: &AdapterId, token: Option<&SecretString>) -> Result<PathBuf>;
}

/// Fetches adapters from the hub into the shared weight cache.
#[derive(Debug, Clone)]
pub struct HubFetcher {
    cache_dir: PathBuf,
}

impl HubFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }
}

#[async_trait]
impl AdapterFetcher for HubFetcher {
    async fn fetch(&self, adapter: &AdapterId, token: Option<&SecretString>) -> Result<PathBuf> {
        if let Some(path) = Cache::new(self.cache_dir.clone())
            .model(adapter.repo.clone())
            .get(&adapter.weight_name)
        {
            tracing::debug!(%adapter, path = %path.display(), "adapter found in cache");
            return Ok(path);
        }

        let mut builder = ApiBuilder::new()
            .with_cache_dir(self.cache_dir.clone())
            .with_progress(false);
        // Without an explicit token the builder falls back to the ambient hub login.
        if let Some(token) = token {
            builder = builder.with_token(Some(token.expose_secret().to_string()));
        }
        let api = builder.build().context("failed to build hub client")?;

        tracing::info!(%adapter, authenticated = token.is_some(), "downloading adapter");
        api.model(adapter.repo.clone())
            .get(&adapter.weight_name)
            .await
            .with_context(|| format!("failed to download '{}'", adapter.weight_name))
    }
}

/// Looks up a file in the local weight cache without touching the network.
pub(crate) fn cached_file(
    cache: &Cache,
    repo_id: &str,
    revision: Option<&str>,
    filename: &str,
) -> Result<PathBuf> {
    let repo = match revision {
        Some(revision) => Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ),
        None => Repo::model(repo_id.to_string()),
    };
    cache
        .repo(repo)
        .get(filename)
        .ok_or_else(|| anyhow!("'{filename}' from '{repo_id}' is not in the weight cache"))
}
