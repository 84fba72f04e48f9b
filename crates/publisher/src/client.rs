//! External publishing platform client.
//!
//! [`PublishingPlatform`] is the seam the workflow and the preprocessor talk
//! to. [`HttpPlatformClient`] implements it over reqwest: every call carries
//! the current token from the [`TokenCache`] and runs under the
//! [`RetryEngine`]. Responses use a JSON envelope where a non-zero `errcode`
//! signals failure.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ExternalError, PublishError, PublishResult, codes};
use crate::retry::RetryEngine;
use crate::token::{CredentialIssuer, IssuedCredential, TokenCache};

/// One article inside a draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DraftArticle {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub content: String,
    /// Platform media ID of the cover image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb_media_id: Option<String>,
}

/// Result of a publish submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublishReceipt {
    pub publish_id: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Bytes to upload as a platform asset.
#[derive(Debug, Clone)]
pub struct AssetUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

/// A platform-hosted copy of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadedAsset {
    pub url: String,
    pub media_id: String,
}

/// Calls against the external publishing platform.
#[async_trait]
pub trait PublishingPlatform: Send + Sync {
    /// Stage articles as a new draft and return its ID.
    async fn create_draft(&self, articles: &[DraftArticle]) -> PublishResult<String>;

    /// Remove a draft.
    async fn delete_draft(&self, draft_id: &str) -> PublishResult<()>;

    /// Publish a staged draft.
    async fn submit_publish(&self, draft_id: &str) -> PublishResult<PublishReceipt>;

    /// Upload an asset and return its platform-hosted URL.
    async fn upload_asset(&self, upload: AssetUpload) -> PublishResult<UploadedAsset>;
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(flatten)]
    body: serde_json::Value,
}

#[derive(Deserialize)]
struct DraftCreated {
    media_id: String,
}

#[derive(Deserialize)]
struct Empty {}

/// Build a shared HTTP client for platform calls.
pub fn build_http_client(timeout: Duration) -> PublishResult<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(format!("herald/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PublishError::Config(format!("Failed to build HTTP client: {e}")))
}

fn endpoint(base: &Url, path: &str) -> PublishResult<Url> {
    base.join(path)
        .map_err(|e| PublishError::Config(format!("Invalid platform URL: {e}")))
}

/// Send a request and unwrap the platform envelope.
async fn send<T: DeserializeOwned>(request: RequestBuilder) -> PublishResult<T> {
    let response = request.send().await.map_err(ExternalError::transport)?;
    let status = response.status();
    let text = response.text().await.map_err(ExternalError::transport)?;

    let envelope: Envelope = match serde_json::from_str(&text) {
        Ok(envelope) => envelope,
        Err(_) if status.as_u16() == 429 => {
            return Err(ExternalError::new(codes::RATE_EXCEEDED, "HTTP 429").into());
        }
        Err(_) if status.is_server_error() => {
            return Err(ExternalError::new(codes::INTERNAL_ERROR, format!("HTTP {status}")).into());
        }
        Err(e) => return Err(ExternalError::malformed(format!("HTTP {status}: {e}")).into()),
    };

    if envelope.errcode != 0 {
        return Err(ExternalError::new(envelope.errcode, envelope.errmsg).into());
    }
    if !status.is_success() {
        return Err(ExternalError::new(i64::from(status.as_u16()), envelope.errmsg).into());
    }

    serde_json::from_value(envelope.body)
        .map_err(|e| ExternalError::malformed(e).into())
}

/// reqwest-backed platform client.
#[derive(Clone)]
pub struct HttpPlatformClient {
    http: Client,
    base_url: Url,
    tokens: Arc<TokenCache>,
    retry: RetryEngine,
    shutdown: CancellationToken,
}

impl HttpPlatformClient {
    /// Create a client. Cancelling `shutdown` aborts pending retries.
    pub fn new(
        http: Client,
        base_url: Url,
        tokens: Arc<TokenCache>,
        retry: RetryEngine,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            http,
            base_url,
            tokens,
            retry,
            shutdown,
        }
    }

    /// One authenticated attempt. Auth errors drop the cached token, unless
    /// it was already replaced, so the next attempt picks up a fresh one.
    async fn call<T, F>(&self, path: &str, build: F) -> PublishResult<T>
    where
        T: DeserializeOwned,
        F: Fn(RequestBuilder) -> PublishResult<RequestBuilder>,
    {
        let token = self.tokens.get_token().await?;
        let url = endpoint(&self.base_url, path)?;
        let request = build(self.http.post(url).query(&[("access_token", token.as_str())]))?;

        let result = send(request).await;
        if let Err(PublishError::External(e)) = &result {
            if e.is_auth_error() {
                tracing::warn!(code = e.code, path, "Platform rejected credential");
                self.tokens.invalidate_if(&token).await;
            }
        }
        result
    }

    async fn call_with_retry<T, F>(&self, path: &str, build: F) -> PublishResult<T>
    where
        T: DeserializeOwned,
        F: Fn(RequestBuilder) -> PublishResult<RequestBuilder>,
    {
        self.retry
            .execute(&self.shutdown, || self.call(path, &build))
            .await
    }
}

#[async_trait]
impl PublishingPlatform for HttpPlatformClient {
    async fn create_draft(&self, articles: &[DraftArticle]) -> PublishResult<String> {
        let body = serde_json::json!({ "articles": articles });
        let created: DraftCreated = self
            .call_with_retry("draft/add", |req| Ok(req.json(&body)))
            .await?;

        tracing::debug!(draft_id = %created.media_id, articles = articles.len(), "Draft created");
        Ok(created.media_id)
    }

    async fn delete_draft(&self, draft_id: &str) -> PublishResult<()> {
        let body = serde_json::json!({ "media_id": draft_id });
        let _: Empty = self
            .call_with_retry("draft/delete", |req| Ok(req.json(&body)))
            .await?;
        Ok(())
    }

    async fn submit_publish(&self, draft_id: &str) -> PublishResult<PublishReceipt> {
        let body = serde_json::json!({ "media_id": draft_id });
        self.call_with_retry("publish/submit", |req| Ok(req.json(&body)))
            .await
    }

    async fn upload_asset(&self, upload: AssetUpload) -> PublishResult<UploadedAsset> {
        let size = upload.bytes.len();
        let uploaded: UploadedAsset = self
            .call_with_retry("material/add", |req| {
                let part = Part::stream(upload.bytes.clone())
                    .file_name(upload.file_name.clone())
                    .mime_str(&upload.content_type)
                    .map_err(|e| ExternalError::new(codes::MALFORMED_RESPONSE, e.to_string()))?;
                Ok(req.multipart(Form::new().part("media", part)))
            })
            .await?;

        tracing::debug!(media_id = %uploaded.media_id, size, "Asset uploaded");
        Ok(uploaded)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Issues credentials from the platform's token endpoint.
#[derive(Clone)]
pub struct HttpCredentialIssuer {
    http: Client,
    base_url: Url,
    app_id: String,
    app_secret: String,
}

impl HttpCredentialIssuer {
    /// Create an issuer for one platform account.
    pub fn new(http: Client, base_url: Url, app_id: String, app_secret: String) -> Self {
        Self {
            http,
            base_url,
            app_id,
            app_secret,
        }
    }
}

#[async_trait]
impl CredentialIssuer for HttpCredentialIssuer {
    async fn issue(&self) -> PublishResult<IssuedCredential> {
        let url = endpoint(&self.base_url, "token")?;
        let request = self.http.get(url).query(&[
            ("grant_type", "client_credential"),
            ("appid", self.app_id.as_str()),
            ("secret", self.app_secret.as_str()),
        ]);

        let response: TokenResponse = send(request).await?;
        Ok(IssuedCredential {
            token: response.access_token,
            ttl: Duration::from_secs(response.expires_in),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parses_error() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"errcode":45009,"errmsg":"reach max api daily quota limit"}"#)
                .unwrap();

        assert_eq!(envelope.errcode, 45009);
        assert_eq!(envelope.errmsg, "reach max api daily quota limit");
    }

    #[test]
    fn test_envelope_body_flattened() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"media_id":"draft-123","item":[]}"#).unwrap();
        let created: DraftCreated = serde_json::from_value(envelope.body).unwrap();

        assert_eq!(envelope.errcode, 0);
        assert_eq!(created.media_id, "draft-123");
    }

    #[test]
    fn test_receipt_url_optional() {
        let receipt: PublishReceipt =
            serde_json::from_str(r#"{"publish_id":"p1"}"#).unwrap();
        assert_eq!(receipt.url, None);
    }

    #[test]
    fn test_draft_article_skips_empty_fields() {
        let article = DraftArticle {
            title: "Launch".to_string(),
            author: None,
            digest: None,
            content: "<p>hi</p>".to_string(),
            thumb_media_id: Some("m1".to_string()),
        };
        let json = serde_json::to_string(&article).unwrap();

        assert!(!json.contains("author"));
        assert!(json.contains("\"thumb_media_id\":\"m1\""));
    }

    #[test]
    fn test_endpoint_join() {
        let base = Url::parse("https://api.platform.example/cgi-bin/").unwrap();
        assert_eq!(
            endpoint(&base, "draft/add").unwrap().as_str(),
            "https://api.platform.example/cgi-bin/draft/add"
        );
    }
}
