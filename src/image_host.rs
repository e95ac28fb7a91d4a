use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use facet::Facet;
use tokio::sync::Mutex;

use crate::error::RoostError;
use crate::fetcher::UrlDownloader;
use crate::simplestreams::{self, Manifest};

/// One resolvable image, as published by an image host.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct VmImageInfo {
    pub aliases: Vec<String>,
    pub release: String,
    #[facet(default)]
    pub release_title: Option<String>,
    pub image_location: String,
    #[facet(default)]
    pub kernel_location: Option<String>,
    #[facet(default)]
    pub initrd_location: Option<String>,
    /// Content hash of the disk image; the vault's cache key.
    pub id: String,
    pub version: String,
}

/// What a caller asks for: the instance the image is for and a release
/// alias, content id, or empty for the host's default.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    pub name: String,
    pub release: String,
}

#[async_trait]
pub trait VmImageHost: Send + Sync {
    async fn info_for(&self, query: &Query) -> Result<VmImageInfo, RoostError>;

    async fn for_each_entry_do(
        &self,
        action: &mut (dyn for<'v> FnMut(&'v VmImageInfo) + Send),
    ) -> Result<(), RoostError>;
}

// ── SimpleStreamsHost ────────────────────────────────────

pub struct SimpleStreamsHostConfig {
    pub host_url: String,
    pub arch: String,
    pub default_alias: String,
    pub manifest_ttl: Duration,
}

struct CachedManifest {
    fetched_at: Instant,
    manifest: Arc<Manifest>,
}

/// Image host backed by a simplestreams mirror, re-reading the manifest
/// once it is older than the configured TTL.
pub struct SimpleStreamsHost {
    config: SimpleStreamsHostConfig,
    downloader: Arc<dyn UrlDownloader>,
    cache: Mutex<Option<CachedManifest>>,
}

impl SimpleStreamsHost {
    pub fn new(config: SimpleStreamsHostConfig, downloader: Arc<dyn UrlDownloader>) -> Self {
        Self {
            config,
            downloader,
            cache: Mutex::new(None),
        }
    }

    async fn manifest(&self) -> Result<Arc<Manifest>, RoostError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() <= self.config.manifest_ttl
        {
            return Ok(cached.manifest.clone());
        }

        let host = &self.config.host_url;
        tracing::debug!(host = %host, "refreshing image manifest");
        let index = self
            .downloader
            .download(&format!("{host}{}", simplestreams::INDEX_PATH))
            .await?;
        let path = simplestreams::manifest_path(&index)?;
        let json = self.downloader.download(&format!("{host}{path}")).await?;
        let manifest = Arc::new(Manifest::from_json(&json, &self.config.arch)?);
        tracing::info!(
            host = %host,
            products = manifest.products.len(),
            updated = %manifest.updated,
            "image manifest loaded"
        );

        *cache = Some(CachedManifest {
            fetched_at: Instant::now(),
            manifest: manifest.clone(),
        });
        Ok(manifest)
    }

    fn resolved(&self, info: &VmImageInfo) -> VmImageInfo {
        let host = &self.config.host_url;
        VmImageInfo {
            image_location: format!("{host}{}", info.image_location),
            kernel_location: info.kernel_location.as_ref().map(|p| format!("{host}{p}")),
            initrd_location: info.initrd_location.as_ref().map(|p| format!("{host}{p}")),
            ..info.clone()
        }
    }
}

#[async_trait]
impl VmImageHost for SimpleStreamsHost {
    async fn info_for(&self, query: &Query) -> Result<VmImageInfo, RoostError> {
        let manifest = self.manifest().await?;
        let key = if query.release.is_empty() {
            self.config.default_alias.as_str()
        } else {
            query.release.as_str()
        };
        manifest
            .find(key)
            .map(|info| self.resolved(info))
            .ok_or_else(|| RoostError::ImageNotFound {
                query: key.to_string(),
            })
    }

    async fn for_each_entry_do(
        &self,
        action: &mut (dyn for<'v> FnMut(&'v VmImageInfo) + Send),
    ) -> Result<(), RoostError> {
        let manifest = self.manifest().await?;
        for info in &manifest.products {
            action(&self.resolved(info));
        }
        Ok(())
    }
}
