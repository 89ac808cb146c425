//! Configuration file handling for pkgsync.
//!
//! The service reads a single TOML file naming the registry target, the
//! directories working copies and artifacts live in, and the repositories it
//! is allowed to publish. Secrets may come from the environment instead of
//! the file.
//!
//! # Example
//!
//! ```
//! use pkgsync_config::Config;
//!
//! let config = Config::from_toml_str(
//!     r#"
//!     owner = "acme"
//!     target_repository = "composer"
//!     repositories_dir = "/var/lib/pkgsync/repos"
//!
//!     [[repositories]]
//!     url = "git@github.com:acme/widgets.git"
//!     publish_source = true
//!     "#,
//!     None,
//! )
//! .expect("config");
//!
//! let repo = config.get_repository("git@github.com:acme/widgets.git").expect("tracked");
//! assert!(repo.publish_source);
//! assert_eq!(
//!     config.working_copy_path(repo).expect("path"),
//!     std::path::Path::new("/var/lib/pkgsync/repos/github.com_acme_widgets"),
//! );
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use pkgsync_git::{RemoteId, git_url_to_directory};
use pkgsync_version::{BranchConvention, DEFAULT_DEV_BRANCHES};
use serde::{Deserialize, Serialize};

/// Default configuration file name
pub const CONFIG_FILE: &str = "pkgsync.toml";

/// Environment variable overriding `webhook.secret`
pub const WEBHOOK_SECRET_ENV: &str = "PKGSYNC_WEBHOOK_SECRET";

/// Environment variable overriding `registry.api_key`
pub const REGISTRY_API_KEY_ENV: &str = "CLOUDSMITH_API_KEY";

/// A repository the service publishes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Remote URL, also used to clone
    pub url: String,
    /// Embed a git `source` block in the published manifest
    #[serde(default)]
    pub publish_source: bool,
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_webhook_path")]
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_webhook_path(),
        }
    }
}

/// Webhook verification settings
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &redact(&self.secret))
            .finish()
    }
}

/// Registry endpoint settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_upload_base")]
    pub upload_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            upload_base: default_upload_base(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("api_base", &self.api_base)
            .field("upload_base", &self.upload_base)
            .field("api_key", &redact(&self.api_key))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Lock file settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long a delivery waits for a working copy held by another process;
    /// zero fails at once
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_secs: default_wait_secs(),
        }
    }
}

impl LockConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

/// Version derivation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersioningConfig {
    /// Branches published as `dev-<branch>`
    #[serde(default = "default_dev_branches")]
    pub dev_branches: Vec<String>,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            dev_branches: default_dev_branches(),
        }
    }
}

impl VersioningConfig {
    pub fn branch_convention(&self) -> BranchConvention {
        BranchConvention::new(self.dev_branches.iter())
    }
}

/// Complete pkgsync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Registry account packages are published under
    pub owner: String,
    /// Registry repository packages are published to
    pub target_repository: String,
    #[serde(default = "default_repositories_dir")]
    pub repositories_dir: PathBuf,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    /// Leave artifacts on disk after upload
    #[serde(default)]
    pub keep_artifacts: bool,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub versioning: VersioningConfig,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_webhook_path() -> String {
    "/webhook".to_string()
}

fn default_api_base() -> String {
    "https://api.cloudsmith.io".to_string()
}

fn default_upload_base() -> String {
    "https://upload.cloudsmith.io".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_wait_secs() -> u64 {
    600
}

fn default_dev_branches() -> Vec<String> {
    DEFAULT_DEV_BRANCHES.iter().map(|b| b.to_string()).collect()
}

fn default_repositories_dir() -> PathBuf {
    PathBuf::from("repositories")
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn redact(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

impl Config {
    /// Load, resolve, override from the environment and validate.
    ///
    /// Relative directories are resolved against the directory holding the
    /// file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let base = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut config = Self::from_toml_str(&content, base)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.apply_env_overrides();
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Parse TOML, resolving relative directories against `base_dir` when given.
    pub fn from_toml_str(content: &str, base_dir: Option<&Path>) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("failed to parse TOML")?;
        if let Some(base) = base_dir {
            config.repositories_dir = resolve_dir(base, &config.repositories_dir);
            config.artifacts_dir = resolve_dir(base, &config.artifacts_dir);
        }
        Ok(config)
    }

    /// Take secrets from the environment when set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        if let Some(secret) = non_empty_env(WEBHOOK_SECRET_ENV) {
            self.webhook.secret = Some(secret);
        }
        if let Some(key) = non_empty_env(REGISTRY_API_KEY_ENV) {
            self.registry.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() {
            bail!("`owner` must not be empty");
        }
        if self.target_repository.trim().is_empty() {
            bail!("`target_repository` must not be empty");
        }
        if !self.server.path.starts_with('/') {
            bail!("`server.path` must start with `/`, got `{}`", self.server.path);
        }
        if self.registry.timeout_secs == 0 {
            bail!("`registry.timeout_secs` must be greater than zero");
        }
        if self.versioning.dev_branches.iter().any(|b| b.trim().is_empty()) {
            bail!("`versioning.dev_branches` must not contain empty names");
        }

        let mut seen: BTreeMap<String, &str> = BTreeMap::new();
        for repo in &self.repositories {
            let dir = git_url_to_directory(&repo.url)
                .with_context(|| format!("invalid repository url `{}`", repo.url))?;
            if let Some(previous) = seen.insert(dir.clone(), &repo.url) {
                bail!(
                    "repositories `{previous}` and `{}` map to the same working copy `{dir}`",
                    repo.url
                );
            }
        }

        Ok(())
    }

    /// Find a tracked repository by one of its remote URLs.
    ///
    /// An exact URL match wins; otherwise URLs naming the same host and path
    /// segments (ssh vs https spelling) are considered equal.
    pub fn get_repository(&self, url: &str) -> Option<&RepositoryConfig> {
        if let Some(repo) = self.repositories.iter().find(|r| r.url == url) {
            return Some(repo);
        }

        let wanted = RemoteId::parse(url).ok()?;
        self.repositories
            .iter()
            .find(|r| RemoteId::parse(&r.url).is_ok_and(|id| id == wanted))
    }

    /// Path of a working copy directory by name
    pub fn repo_path(&self, dir_name: &str) -> PathBuf {
        self.repositories_dir.join(dir_name)
    }

    /// Path of an artifact file by name
    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.artifacts_dir.join(file_name)
    }

    /// Working copy path for a tracked repository
    pub fn working_copy_path(&self, repo: &RepositoryConfig) -> Result<PathBuf> {
        let dir = git_url_to_directory(&repo.url)?;
        Ok(self.repo_path(&dir))
    }
}

fn resolve_dir(base: &Path, dir: &Path) -> PathBuf {
    if dir.is_relative() {
        base.join(dir)
    } else {
        dir.to_path_buf()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Find the configuration file by walking up from `start_dir`.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    start_dir
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}
