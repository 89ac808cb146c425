//! Registry API client for pkgsync.
//!
//! Publishing is two idempotent steps against a Cloudsmith Composer
//! repository: remove whatever is currently stored for a package version,
//! then upload the replacement archive. The pipeline only sees the
//! [`PackageRegistry`] trait; [`CloudsmithClient`] is the HTTP
//! implementation.
//!
//! # Example
//!
//! ```no_run
//! use pkgsync_registry::{CloudsmithClient, PackageRegistry, RegistryTarget};
//! use pkgsync_version::{RefKind, derive_version};
//! use std::path::Path;
//!
//! let client = CloudsmithClient::cloudsmith(Some("api-key".to_string()));
//! let target = RegistryTarget::new("acme", "composer");
//! let version = derive_version("2.1.0", RefKind::Tag).expect("version");
//!
//! client.delete_if_exists(&target, "acme/widgets", &version).expect("delete");
//! let receipt = client
//!     .upload(&target, Path::new("/srv/artifacts/acme-widgets-3f2a9c1.zip"))
//!     .expect("upload");
//! println!("published {}", receipt.slug_perm);
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use pkgsync_version::PackageVersion;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default Cloudsmith API endpoint
pub const CLOUDSMITH_API: &str = "https://api.cloudsmith.io";

/// Default Cloudsmith upload endpoint
pub const CLOUDSMITH_UPLOAD: &str = "https://upload.cloudsmith.io";

/// Default timeout for API requests; uploads can be large
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default user agent for API requests
pub const USER_AGENT: &str = concat!("pkgsync/", env!("CARGO_PKG_VERSION"));

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "X-Api-Key";

const PAGE_SIZE: &str = "100";

/// Owner and repository packages are published to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTarget {
    pub owner: String,
    pub repository: String,
}

impl RegistryTarget {
    pub fn new(owner: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repository: repository.into(),
        }
    }
}

impl fmt::Display for RegistryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repository)
    }
}

/// What the registry reports back for an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryReceipt {
    pub slug_perm: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub self_html_url: Option<String>,
}

/// Upload failure, split by whether retrying could help.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The registry refused the package itself (duplicate, invalid archive).
    #[error("registry rejected the package ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// Transport, authentication or server failure.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl UploadError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, UploadError::Rejected { .. })
    }
}

/// Operations the pipeline needs from a registry.
pub trait PackageRegistry: Send + Sync {
    /// Remove every stored package matching `package` at `version`.
    ///
    /// Returns whether anything was deleted; absence is not an error.
    fn delete_if_exists(
        &self,
        target: &RegistryTarget,
        package: &str,
        version: &PackageVersion,
    ) -> Result<bool>;

    /// Upload an artifact as a new package.
    fn upload(&self, target: &RegistryTarget, artifact: &Path) -> Result<RegistryReceipt, UploadError>;
}

/// Package entry from the listing endpoint
#[derive(Debug, Clone, Deserialize)]
struct PackageSummary {
    slug_perm: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Response of the direct file upload
#[derive(Debug, Deserialize)]
struct FileUpload {
    identifier: String,
}

/// Cloudsmith API client
#[derive(Debug, Clone)]
pub struct CloudsmithClient {
    api_base: String,
    upload_base: String,
    api_key: Option<String>,
    timeout: Duration,
    client: Client,
}

impl CloudsmithClient {
    /// Create a client for the given API and upload endpoints
    pub fn new(api_base: &str, upload_base: &str, api_key: Option<String>) -> Self {
        let timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
            api_key,
            timeout,
            client: build_client(timeout),
        }
    }

    /// Create a client for the public Cloudsmith service
    pub fn cloudsmith(api_key: Option<String>) -> Self {
        Self::new(CLOUDSMITH_API, CLOUDSMITH_UPLOAD, api_key)
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.client = build_client(timeout);
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn upload_base(&self) -> &str {
        &self.upload_base
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    fn packages_url(&self, target: &RegistryTarget) -> String {
        format!(
            "{}/v1/packages/{}/{}/",
            self.api_base, target.owner, target.repository
        )
    }

    fn list_packages(&self, target: &RegistryTarget, query: &str) -> Result<Vec<PackageSummary>> {
        let url = reqwest::Url::parse_with_params(
            &self.packages_url(target),
            &[("query", query), ("page_size", PAGE_SIZE)],
        )
        .context("failed to build package list URL")?;

        tracing::debug!(%url, "listing packages");
        let response = self
            .authorized(self.client.get(url))
            .send()
            .context("failed to send request to registry")?;

        match response.status() {
            StatusCode::OK => response.json().context("failed to parse package list"),
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status => Err(anyhow!(
                "unexpected status while listing packages: {status}: {}",
                error_detail(response)
            )),
        }
    }

    fn delete_package(&self, target: &RegistryTarget, slug_perm: &str) -> Result<bool> {
        let url = format!("{}{}/", self.packages_url(target), slug_perm);

        tracing::debug!(%url, "deleting package");
        let response = self
            .authorized(self.client.delete(&url))
            .send()
            .context("failed to send delete request to registry")?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(anyhow!(
                "unexpected status while deleting {slug_perm}: {status}: {}",
                error_detail(response)
            )),
        }
    }

    fn upload_file(&self, target: &RegistryTarget, artifact: &Path) -> Result<String, UploadError> {
        let filename = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("artifact path {} has no file name", artifact.display()))?;
        let body = fs::read(artifact)
            .with_context(|| format!("failed to read artifact {}", artifact.display()))?;
        let checksum = hex::encode(Sha256::digest(&body));

        let url = format!(
            "{}/{}/{}/{}",
            self.upload_base, target.owner, target.repository, filename
        );

        tracing::debug!(%url, bytes = body.len(), "uploading artifact");
        let response = self
            .authorized(self.client.put(&url))
            .header("Content-Sha256", checksum)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .context("failed to send artifact to registry")?;

        let upload: FileUpload = expect_success(response, "artifact upload")?
            .json()
            .context("failed to parse upload response")?;
        Ok(upload.identifier)
    }

    fn create_package(
        &self,
        target: &RegistryTarget,
        identifier: &str,
    ) -> Result<RegistryReceipt, UploadError> {
        let url = format!("{}upload/composer/", self.packages_url(target));

        tracing::debug!(%url, identifier, "creating composer package");
        let response = self
            .authorized(self.client.post(&url))
            .json(&serde_json::json!({ "package_file": identifier }))
            .send()
            .context("failed to send package creation request")?;

        let receipt = expect_success(response, "package creation")?
            .json()
            .context("failed to parse package creation response")?;
        Ok(receipt)
    }
}

impl PackageRegistry for CloudsmithClient {
    fn delete_if_exists(
        &self,
        target: &RegistryTarget,
        package: &str,
        version: &PackageVersion,
    ) -> Result<bool> {
        let query = format!("name:{package} AND version:{}", version.raw);
        let matches: Vec<PackageSummary> = self
            .list_packages(target, &query)?
            .into_iter()
            .filter(|p| p.name.as_deref() == Some(package))
            .filter(|p| {
                p.version.as_deref() == Some(version.raw.as_str())
                    || p.version.as_deref() == Some(version.normalized.as_str())
            })
            .collect();

        let mut deleted = false;
        for summary in &matches {
            deleted |= self.delete_package(target, &summary.slug_perm)?;
        }

        if deleted {
            tracing::info!(package, version = %version, %target, "deleted existing package");
        }
        Ok(deleted)
    }

    fn upload(&self, target: &RegistryTarget, artifact: &Path) -> Result<RegistryReceipt, UploadError> {
        let identifier = self.upload_file(target, artifact)?;
        let receipt = self.create_package(target, &identifier)?;
        tracing::info!(slug = %receipt.slug_perm, %target, "uploaded package");
        Ok(receipt)
    }
}

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Map a non-success response to [`UploadError`].
///
/// 400, 409 and 422 mean the registry looked at the package and refused it;
/// anything else is a failure of the request itself.
fn expect_success(response: Response, action: &str) -> Result<Response, UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let detail = error_detail(response);
    match status {
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            Err(UploadError::Rejected {
                status: status.as_u16(),
                message: detail,
            })
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(UploadError::Failed(anyhow!(
            "{action} was not authorized ({status}); check the registry API key: {detail}"
        ))),
        _ => Err(UploadError::Failed(anyhow!(
            "{action} failed with status {status}: {detail}"
        ))),
    }
}

/// Best-effort human readable error from a response body
fn error_detail(response: Response) -> String {
    let body = response.text().unwrap_or_default();
    parse_error_detail(&body)
}

fn parse_error_detail(body: &str) -> String {
    #[derive(Deserialize)]
    struct ApiError {
        detail: Option<String>,
        #[serde(default)]
        fields: serde_json::Map<String, serde_json::Value>,
    }

    match serde_json::from_str::<ApiError>(body) {
        Ok(err) => {
            let mut parts: Vec<String> = err.detail.into_iter().collect();
            for (field, value) in err.fields {
                let text = match value {
                    serde_json::Value::Array(items) => items
                        .iter()
                        .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
                        .collect::<Vec<_>>()
                        .join(" "),
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                parts.push(format!("{field}: {text}"));
            }
            if parts.is_empty() {
                body.trim().to_string()
            } else {
                parts.join("; ")
            }
        }
        Err(_) => body.trim().to_string(),
    }
}
