//! Resilient publishing to the external content platform.
//!
//! - **Retry**: in-call exponential backoff over a configurable code allow-list
//! - **Token cache**: single-flight credential renewal ahead of expiry
//! - **Client**: reqwest calls for drafts, publishing and asset uploads
//! - **Preprocessing**: rewrites embedded images to platform-hosted copies
//! - **Workflow**: the idempotent publish/expire state machine
//! - **Handlers and scans**: the worker-pool and cron side of the above

pub mod client;
pub mod error;
pub mod handlers;
pub mod preprocess;
pub mod retry;
pub mod scans;
pub mod store;
pub mod token;
pub mod workflow;

pub use client::{
    AssetUpload, DraftArticle, HttpCredentialIssuer, HttpPlatformClient, PublishReceipt,
    PublishingPlatform, UploadedAsset, build_http_client,
};
pub use error::{ErrorKind, ExternalError, PublishError, PublishResult, codes};
pub use handlers::{ExpireHandler, PublishHandler, RefreshCredentialHandler, handler_result, registry};
pub use preprocess::{
    ContentPreprocessor, HttpFetcher, PreprocessConfig, PreprocessOutcome, RemoteAsset,
    RemoteFetcher, UrlOrigin,
};
pub use retry::{RetryEngine, RetryPolicy};
pub use scans::{CronConfig, Maintenance, ScanConfig, Scanner, cron_jobs};
pub use store::{
    Asset, AssetStore, ContentItem, DbAssetStore, DbDomainStore, DomainStore, ItemState,
};
pub use token::{CachedCredential, CredentialIssuer, IssuedCredential, TokenCache, TokenCacheConfig};
pub use workflow::{PublishReport, PublishingWorkflow};
