//! Fetch precomputed tier rasters from the remote thumbnail store.
//!
//! Every failure mode here is a miss, never an error: the generation
//! scheduler falls through to local rasterization when the remote store
//! cannot answer in time.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::codec::{self, Raster};
use crate::types::Tier;

use crate::Result;

/// Source of precomputed tier rasters addressed by server-assigned name.
#[async_trait]
pub trait TierFetcher: Send + Sync {
    /// Fetch one tier, `None` on any miss (non-2xx, timeout, decode failure).
    async fn fetch_tier(&self, server_name: &str, tier: Tier) -> Option<Raster>;
}

/// Connection parameters for the remote thumbnail store.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL of the asset server, without a trailing slash.
    pub base_url: String,
    /// File extension the store serves thumbnails under.
    pub extension: String,
    /// Per-request timeout; an elapsed timeout counts as a miss.
    pub timeout: Duration,
    /// Retries after the first attempt before giving up on a tier.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    pub backoff_base: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            extension: "png".to_string(),
            timeout: Duration::from_secs(4),
            max_retries: 2,
            backoff_base: Duration::from_millis(250),
        }
    }
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), ..Default::default() }
    }
}

/// HTTP implementation of [`TierFetcher`].
///
/// URLs are derived from the resource entry's server-assigned name; the
/// content hash itself never appears on the wire.
#[derive(Debug)]
pub struct RemoteFallbackLoader {
    client: reqwest::Client,
    config: RemoteConfig,
}

impl RemoteFallbackLoader {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    /// Deterministic URL for one tier of a named asset.
    pub fn tier_url(&self, server_name: &str, tier: Tier) -> String {
        format!(
            "{}/thumbnails/{}/{}.{}",
            self.config.base_url.trim_end_matches('/'),
            tier,
            server_name,
            self.config.extension
        )
    }

    async fn fetch_once(&self, url: &str) -> Result<Raster> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("remote answered {status}");
        }
        let body = response.bytes().await?;
        codec::decode_bytes(&body)
    }
}

#[async_trait]
impl TierFetcher for RemoteFallbackLoader {
    async fn fetch_tier(&self, server_name: &str, tier: Tier) -> Option<Raster> {
        let url = self.tier_url(server_name, tier);
        let mut backoff = self.config.backoff_base;

        for attempt in 0..=self.config.max_retries {
            match self.fetch_once(&url).await {
                Ok(raster) => return Some(raster),
                Err(err) => {
                    debug!(%url, attempt, "remote tier fetch missed: {err}");
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        None
    }
}
