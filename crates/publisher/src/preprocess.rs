//! Content preprocessing.
//!
//! Before a body is staged on the platform, every embedded image must point at
//! a platform-hosted copy. References are handled one at a time and a failure
//! only leaves that one reference untouched.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use herald_common::storage::scratch_key;
use herald_common::{AppError, FileStore};
use regex::{Captures, Regex};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use crate::client::{AssetUpload, PublishingPlatform, UploadedAsset};
use crate::error::{PublishError, PublishResult};
use crate::store::{Asset, AssetStore};

#[allow(clippy::unwrap_used)]
static IMG_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());

#[allow(clippy::unwrap_used)]
static SRC_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(\s(?:data-src|src)\s*=\s*)(["'])([^"']*)(["'])"#).unwrap()
});

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Preprocessor settings.
#[derive(Debug, Clone, Default)]
pub struct PreprocessConfig {
    /// Prefix of URLs served from the local media root.
    pub public_base_url: String,
    /// Hosts that already serve platform copies.
    pub media_hosts: Vec<String>,
}

/// Where an embedded URL points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlOrigin {
    /// Already a platform copy.
    Platform,
    /// Served from our own media root.
    Local,
    /// Any other http(s) host.
    ThirdParty,
    /// Not fetchable (data URIs, relative paths, other schemes).
    Unsupported,
}

/// Result of preprocessing a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessOutcome {
    /// Body with substituted references.
    pub body: String,
    /// Original URL to platform URL, for every substituted reference.
    pub replaced: BTreeMap<String, String>,
}

/// A downloaded third-party asset.
#[derive(Debug, Clone)]
pub struct RemoteAsset {
    /// `Content-Type` reported by the host.
    pub content_type: String,
    /// Body.
    pub bytes: Bytes,
}

/// Downloads third-party assets.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Download `url`.
    async fn fetch(&self, url: &Url) -> PublishResult<RemoteAsset>;
}

fn download_error(err: impl std::fmt::Display) -> PublishError {
    PublishError::Store(AppError::ExternalService(format!("Asset download failed: {err}")))
}

/// reqwest-backed fetcher with a size cap.
#[derive(Clone)]
pub struct HttpFetcher {
    http: Client,
    max_bytes: usize,
}

impl HttpFetcher {
    /// Create a fetcher that refuses bodies larger than `max_bytes`.
    #[must_use]
    pub const fn new(http: Client, max_bytes: usize) -> Self {
        Self { http, max_bytes }
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> PublishResult<RemoteAsset> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(download_error(format!("unsupported scheme {}", url.scheme())));
        }

        let mut response = self
            .http
            .get(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(download_error)?;

        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            return Err(download_error(format!("larger than {} bytes", self.max_bytes)));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(FALLBACK_CONTENT_TYPE)
            .to_string();

        let mut buf = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(download_error)? {
            if buf.len() + chunk.len() > self.max_bytes {
                return Err(download_error(format!("larger than {} bytes", self.max_bytes)));
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(RemoteAsset {
            content_type,
            bytes: buf.freeze(),
        })
    }
}

/// Distinct image URLs in document order.
#[must_use]
pub fn extract_image_urls(body: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for tag in IMG_TAG_RE.find_iter(body) {
        for caps in SRC_ATTR_RE.captures_iter(tag.as_str()) {
            let url = caps[3].trim();
            if !url.is_empty() && !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        }
    }
    urls
}

/// Substitute image URLs found in `replaced`. Text outside image tags is untouched.
#[must_use]
pub fn rewrite_image_urls(body: &str, replaced: &BTreeMap<String, String>) -> String {
    if replaced.is_empty() {
        return body.to_string();
    }

    IMG_TAG_RE
        .replace_all(body, |tag: &Captures<'_>| {
            SRC_ATTR_RE
                .replace_all(&tag[0], |attr: &Captures<'_>| {
                    let url = attr[3].trim();
                    let target = replaced.get(url).map_or(&attr[3], String::as_str);
                    format!("{}{}{}{}", &attr[1], &attr[2], target, &attr[4])
                })
                .into_owned()
        })
        .into_owned()
}

fn file_name_of(path: &str) -> String {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("asset")
        .to_string()
}

fn extension_of(file_name: &str) -> &str {
    file_name.rsplit_once('.').map_or("", |(_, ext)| ext)
}

/// Rewrites embedded asset references to platform-hosted URLs.
pub struct ContentPreprocessor {
    platform: Arc<dyn PublishingPlatform>,
    assets: Arc<dyn AssetStore>,
    fetcher: Arc<dyn RemoteFetcher>,
    scratch: Arc<dyn FileStore>,
    config: PreprocessConfig,
}

impl ContentPreprocessor {
    /// Create a preprocessor. Downloads are staged in `scratch`.
    pub fn new(
        platform: Arc<dyn PublishingPlatform>,
        assets: Arc<dyn AssetStore>,
        fetcher: Arc<dyn RemoteFetcher>,
        scratch: Arc<dyn FileStore>,
        config: PreprocessConfig,
    ) -> Self {
        Self {
            platform,
            assets,
            fetcher,
            scratch,
            config,
        }
    }

    /// Classify a URL.
    #[must_use]
    pub fn origin_of(&self, raw: &str) -> UrlOrigin {
        let base = self.config.public_base_url.trim_end_matches('/');
        if !base.is_empty() {
            if let Some(rest) = raw.strip_prefix(base) {
                if rest.is_empty() || rest.starts_with(['/', '?', '#']) {
                    return UrlOrigin::Local;
                }
            }
        }

        let Ok(url) = Url::parse(raw) else {
            return UrlOrigin::Unsupported;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return UrlOrigin::Unsupported;
        }

        let host = url.host_str().unwrap_or_default();
        let platform_hosted = self.config.media_hosts.iter().any(|h| {
            host.eq_ignore_ascii_case(h)
                || host
                    .to_ascii_lowercase()
                    .ends_with(&format!(".{}", h.to_ascii_lowercase()))
        });

        if platform_hosted {
            UrlOrigin::Platform
        } else {
            UrlOrigin::ThirdParty
        }
    }

    /// Rewrite every image reference in `body`.
    pub async fn process(&self, body: &str) -> PreprocessOutcome {
        let mut replaced = BTreeMap::new();

        for url in extract_image_urls(body) {
            let result = match self.origin_of(&url) {
                UrlOrigin::Platform | UrlOrigin::Unsupported => continue,
                UrlOrigin::Local => self.resolve_local(&url).await,
                UrlOrigin::ThirdParty => self.resolve_remote(&url).await,
            };

            match result {
                Ok(platform_url) => {
                    replaced.insert(url, platform_url);
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Asset preprocessing failed, keeping original URL");
                }
            }
        }

        if !replaced.is_empty() {
            tracing::debug!(replaced = replaced.len(), "Asset references rewritten");
        }

        PreprocessOutcome {
            body: rewrite_image_urls(body, &replaced),
            replaced,
        }
    }

    /// Platform media ID for a local asset, uploading it first if needed.
    pub async fn media_id_for(&self, asset_id: &str) -> PublishResult<String> {
        let asset = self
            .assets
            .find_by_id(asset_id)
            .await?
            .ok_or_else(|| PublishError::NotFound(format!("asset {asset_id}")))?;

        if let Some(media_id) = &asset.platform_media_id {
            return Ok(media_id.clone());
        }
        Ok(self.upload_local(&asset).await?.media_id)
    }

    async fn resolve_local(&self, url: &str) -> PublishResult<String> {
        let asset = self
            .assets
            .find_by_url(url)
            .await?
            .ok_or_else(|| PublishError::NotFound(format!("asset {url}")))?;

        if let Some(platform_url) = &asset.platform_url {
            return Ok(platform_url.clone());
        }
        Ok(self.upload_local(&asset).await?.url)
    }

    async fn upload_local(&self, asset: &Asset) -> PublishResult<UploadedAsset> {
        let bytes = self.assets.read(asset).await?;
        let uploaded = self
            .platform
            .upload_asset(AssetUpload {
                file_name: file_name_of(&asset.storage_key),
                content_type: asset.content_type.clone(),
                bytes,
            })
            .await?;

        if let Err(e) = self.assets.record_upload(&asset.id, &uploaded).await {
            tracing::warn!(asset_id = %asset.id, error = %e, "Failed to record platform copy");
        }
        Ok(uploaded)
    }

    async fn resolve_remote(&self, raw: &str) -> PublishResult<String> {
        let url = Url::parse(raw).map_err(download_error)?;
        let remote = self.fetcher.fetch(&url).await?;

        let file_name = file_name_of(url.path());
        let key = scratch_key(extension_of(&file_name));
        self.scratch.write(&key, &remote.bytes).await?;

        let result = async {
            let bytes = Bytes::from(self.scratch.read(&key).await?);
            self.platform
                .upload_asset(AssetUpload {
                    file_name,
                    content_type: remote.content_type,
                    bytes,
                })
                .await
        }
        .await;

        if let Err(e) = self.scratch.delete(&key).await {
            tracing::warn!(key = %key, error = %e, "Failed to delete scratch file");
        }

        Ok(result?.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_distinct_in_order() {
        let body = r#"<p>intro</p>
            <img src="https://cdn.example.com/a.png" alt="a">
            <IMG class="x" data-src='/media/b.jpg'>
            <img src="https://cdn.example.com/a.png">
            <a href="https://cdn.example.com/c.png">not an image</a>"#;

        assert_eq!(
            extract_image_urls(body),
            vec!["https://cdn.example.com/a.png", "/media/b.jpg"]
        );
    }

    #[test]
    fn test_rewrite_only_touches_image_attributes() {
        let body = r#"<img src="https://cdn.example.com/a.png"> see https://cdn.example.com/a.png"#;
        let replaced = BTreeMap::from([(
            "https://cdn.example.com/a.png".to_string(),
            "https://mmbiz.example.net/x".to_string(),
        )]);

        assert_eq!(
            rewrite_image_urls(body, &replaced),
            r#"<img src="https://mmbiz.example.net/x"> see https://cdn.example.com/a.png"#
        );
    }

    #[test]
    fn test_rewrite_does_not_match_prefixes() {
        let body = r#"<img src="https://a.example/x.png?v=2">"#;
        let replaced = BTreeMap::from([(
            "https://a.example/x.png".to_string(),
            "https://mmbiz.example.net/x".to_string(),
        )]);

        assert_eq!(rewrite_image_urls(body, &replaced), body);
    }

    #[test]
    fn test_file_name_and_extension() {
        assert_eq!(file_name_of("2024/01/photo.jpeg"), "photo.jpeg");
        assert_eq!(file_name_of("/"), "asset");
        assert_eq!(extension_of("photo.jpeg"), "jpeg");
        assert_eq!(extension_of("photo"), "");
    }
}
