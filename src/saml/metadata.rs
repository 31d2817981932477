//! Identity provider metadata, loaded once at startup from a file or over the network.

use crate::saml::error::{BoxError, ErrorKind, SamlError};
use async_trait::async_trait;
use samael::metadata::EntityDescriptor;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const SCHEME_FILE: &str = "file://";
pub const SCHEME_HTTP: &str = "http://";
pub const SCHEME_HTTPS: &str = "https://";

/// Where the metadata lives, decided by the URL scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataLocation {
    File(PathBuf),
    Network(Url),
}

impl MetadataLocation {
    /// # Errors
    /// Returns `Config` for an unsupported scheme or an unparsable URL.
    pub fn parse(metadata_url: &str) -> Result<Self, SamlError> {
        if let Some(path) = metadata_url.strip_prefix(SCHEME_FILE) {
            return Ok(Self::File(PathBuf::from(path)));
        }

        if metadata_url.starts_with(SCHEME_HTTPS) || metadata_url.starts_with(SCHEME_HTTP) {
            return Url::parse(metadata_url)
                .map(Self::Network)
                .map_err(|e| SamlError::with_cause(ErrorKind::Config, e));
        }

        Err(SamlError::with_cause(
            ErrorKind::Config,
            format!("unsupported IdP metadata URL scheme: {metadata_url}"),
        ))
    }
}

/// I/O needed to obtain the raw metadata document.
#[async_trait]
pub trait MetadataReader: Send + Sync {
    async fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>>;

    async fn download(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>, BoxError>;
}

/// Reads from the local filesystem and downloads with `reqwest`.
#[derive(Debug, Clone)]
pub struct SystemMetadataReader {
    client: reqwest::Client,
}

impl SystemMetadataReader {
    /// # Errors
    /// Returns `Config` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, SamlError> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .build()
            .map_err(|e| SamlError::with_cause(ErrorKind::Config, e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MetadataReader for SystemMetadataReader {
    async fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn download(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>, BoxError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Attempt `n` (starting at 1) waits at most `base_timeout * n`, and the loader sleeps
/// that long before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            base_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn timeout(&self, attempt: u32) -> Duration {
        self.base_timeout.saturating_mul(attempt)
    }
}

pub struct IdentityProviderMetadataLoader<R> {
    reader: R,
    retry: RetryPolicy,
}

impl<R: MetadataReader> IdentityProviderMetadataLoader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolve and parse the IdP metadata behind `metadata_url`.
    ///
    /// # Errors
    /// `Config` for an unsupported URL, `Disk` and `InvalidIdpMetadata` for files,
    /// `DownloadIdpMetadata` once every network attempt has failed.
    #[instrument(skip(self))]
    pub async fn fetch_idp_metadata(
        &self,
        metadata_url: &str,
    ) -> Result<EntityDescriptor, SamlError> {
        match MetadataLocation::parse(metadata_url)? {
            MetadataLocation::File(path) => self.fetch_from_file(&path).await,
            MetadataLocation::Network(url) => self.fetch_from_network(&url).await,
        }
    }

    async fn fetch_from_file(&self, path: &Path) -> Result<EntityDescriptor, SamlError> {
        let bytes = self
            .reader
            .read_file(path)
            .await
            .map_err(|e| SamlError::with_cause(ErrorKind::Disk, e))?;

        let descriptor = parse_metadata(&bytes)
            .map_err(|e| SamlError::with_cause(ErrorKind::InvalidIdpMetadata, e))?;

        info!("Loaded IdP metadata from {}", path.display());

        Ok(descriptor)
    }

    async fn fetch_from_network(&self, url: &Url) -> Result<EntityDescriptor, SamlError> {
        let mut last_error: Option<BoxError> = None;

        for attempt in 1..=self.retry.attempts {
            let timeout = self.retry.timeout(attempt);
            debug!("Downloading IdP metadata from {url}, attempt {attempt}, timeout {timeout:?}");

            let result = match self.reader.download(url, timeout).await {
                Ok(bytes) => parse_metadata(&bytes),
                Err(e) => Err(e),
            };

            match result {
                Ok(descriptor) => {
                    info!("Loaded IdP metadata from {url}");
                    return Ok(descriptor);
                }
                Err(e) => {
                    warn!("Failed to download IdP metadata (attempt {attempt}): {e}");
                    last_error = Some(e);
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(timeout).await;
                    }
                }
            }
        }

        Err(match last_error {
            Some(e) => SamlError::with_cause(ErrorKind::DownloadIdpMetadata, e),
            None => SamlError::new(ErrorKind::DownloadIdpMetadata),
        })
    }
}

/// Parse an `EntityDescriptor` document.
///
/// # Errors
/// Returns an error if the bytes are not UTF-8 or not valid metadata.
pub fn parse_metadata(bytes: &[u8]) -> Result<EntityDescriptor, BoxError> {
    let xml = std::str::from_utf8(bytes)?;
    let descriptor: EntityDescriptor =
        samael::metadata::de::from_str(xml).map_err(|e| format!("{e}"))?;
    Ok(descriptor)
}
