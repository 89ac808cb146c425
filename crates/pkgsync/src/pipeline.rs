//! The event-to-publish pipeline.
//!
//! One run takes a push from "which repository?" to "what is in the
//! registry now". The working copy is locked for the whole run and reset to
//! the checked-out commit on every exit path past checkout.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use pkgsync_config::{Config, RepositoryConfig};
use pkgsync_git::{WorkingCopy, create_artifact};
use pkgsync_lock::RepoLocks;
use pkgsync_manifest::{Source, load_file, mutate_file};
use pkgsync_registry::{CloudsmithClient, PackageRegistry, RegistryTarget, UploadError};
use pkgsync_version::{BranchConvention, RefName, derive_version_with};
use pkgsync_webhook::{Event, EventKind, GithubWebhook, WebhookRequest};
use serde::{Deserialize, Serialize};
use tracing::field::Empty;

use crate::outcome::{Outcome, PipelineError, Response};

/// Events the pipeline answers; anything else is refused with 422.
pub const ACCEPTED_EVENTS: &[EventKind] = &[EventKind::Push, EventKind::Ping];

/// A run requested directly rather than through a webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Any remote URL of a configured repository
    pub repository: String,
    /// `refs/heads/<branch>`, `refs/tags/<tag>` or a bare branch name
    pub git_ref: String,
    /// Treat the ref as deleted upstream
    #[serde(default)]
    pub deleted: bool,
}

/// Build the registry client described by the configuration.
pub fn cloudsmith_client(config: &Config) -> CloudsmithClient {
    CloudsmithClient::new(
        &config.registry.api_base,
        &config.registry.upload_base,
        config.registry.api_key.clone(),
    )
    .with_timeout(config.registry.timeout())
}

/// Orchestrates webhook deliveries into registry updates.
pub struct Pipeline {
    config: Config,
    webhook: GithubWebhook,
    registry: Arc<dyn PackageRegistry>,
    locks: RepoLocks,
    target: RegistryTarget,
    convention: BranchConvention,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("target", &self.target)
            .field("webhook", &self.webhook)
            .field("repositories", &self.config.repositories.len())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(config: Config, registry: Arc<dyn PackageRegistry>) -> Self {
        Self {
            webhook: GithubWebhook::new(config.webhook.secret.clone()),
            locks: RepoLocks::new(config.lock.wait()),
            target: RegistryTarget::new(&config.owner, &config.target_repository),
            convention: config.versioning.branch_convention(),
            registry,
            config,
        }
    }

    /// Pipeline publishing through the configured Cloudsmith endpoints.
    pub fn from_config(config: Config) -> Self {
        let registry = Arc::new(cloudsmith_client(&config));
        Self::new(config, registry)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn target(&self) -> &RegistryTarget {
        &self.target
    }

    /// Handle one delivery end to end and render the response.
    pub fn handle(&self, request: &WebhookRequest) -> Response {
        let span = tracing::info_span!(
            "delivery",
            delivery = request.delivery().unwrap_or("-"),
            event = Empty,
            repository = Empty,
        );
        let _entered = span.enter();

        let result = self.process(request);
        let response = Response::from(&result);
        match &result {
            Ok(outcome) => tracing::info!(status = response.status, ?outcome, "delivery handled"),
            Err(e) if response.status >= 500 => {
                tracing::error!(status = response.status, "delivery failed: {e}")
            }
            Err(e) => tracing::warn!(status = response.status, "delivery refused: {e}"),
        }
        response
    }

    /// Verify a delivery and run the pipeline for it.
    pub fn process(&self, request: &WebhookRequest) -> Result<Outcome, PipelineError> {
        let event = self.webhook.parse(request, ACCEPTED_EVENTS)?;
        tracing::Span::current().record("event", event.kind().as_str());

        match event {
            Event::Ping(ping) => Ok(Outcome::Pong {
                hook_id: ping.hook_id,
            }),
            Event::Push(push) => {
                let repo = push
                    .repository
                    .remote_urls()
                    .find_map(|url| self.config.get_repository(url))
                    .ok_or(PipelineError::RepositoryNotConfigured)?;
                self.run(repo, &RefName::parse(&push.git_ref), push.deleted)
            }
        }
    }

    /// Run the pipeline for a repository and ref without a webhook.
    pub fn sync(&self, request: &SyncRequest) -> Result<Outcome, PipelineError> {
        let repo = self
            .config
            .get_repository(&request.repository)
            .ok_or(PipelineError::RepositoryNotConfigured)?;
        self.run(repo, &RefName::parse(&request.git_ref), request.deleted)
    }

    fn run(
        &self,
        repo: &RepositoryConfig,
        ref_name: &RefName,
        deleted: bool,
    ) -> Result<Outcome, PipelineError> {
        tracing::Span::current().record("repository", repo.url.as_str());

        let path = self.config.working_copy_path(repo)?;
        let _lock = self.locks.lock(&path, &repo.url)?;

        tracing::info!(path = %path.display(), "syncing working copy");
        let copy = WorkingCopy::sync(&repo.url, &path)?;
        let resolved = copy.resolve(ref_name)?;
        let checkout = copy.checkout(&resolved)?;
        tracing::info!(commit = resolved.short_commit(), kind = %resolved.kind(), "checked out {}", ref_name.short_name());

        let manifest = load_file(checkout.path())?;
        let package_id = manifest.name().map_err(anyhow::Error::from)?.to_string();
        let reference = ref_name.short_name().to_string();

        let version = match derive_version_with(ref_name.full(), ref_name.kind(), &self.convention)
        {
            Ok(version) => version,
            Err(reason) => {
                tracing::info!(package = %package_id, "skipping: {reason}");
                return Ok(Outcome::Skipped {
                    package: package_id,
                    reference,
                    reason: reason.to_string(),
                });
            }
        };
        tracing::info!(package = %package_id, version = %version, normalized = %version.normalized, "derived version");

        let existed = self
            .registry
            .delete_if_exists(&self.target, &package_id, &version)
            .map_err(|source| PipelineError::Registry {
                package: package_id.clone(),
                reference: reference.clone(),
                source,
            })?;

        if deleted {
            tracing::info!(package = %package_id, version = %version, existed, "ref deleted upstream");
            return Ok(Outcome::Deleted {
                package: package_id,
                version,
                existed,
            });
        }

        let package = manifest.package_name()?;
        let source = repo
            .publish_source
            .then(|| Source::git(&repo.url, &resolved.commit));
        mutate_file(
            checkout.path(),
            &version.raw,
            &version.normalized,
            source.as_ref(),
        )?;

        let artifact = self
            .config
            .artifact_path(&package.artifact_file_name(&resolved.commit));
        create_artifact(checkout.path(), &artifact)?;

        let uploaded = self.registry.upload(&self.target, &artifact);
        if !self.config.keep_artifacts {
            remove_artifact(&artifact);
        }

        match uploaded {
            Ok(receipt) => {
                tracing::info!(package = %package_id, version = %version, slug = %receipt.slug_perm, "published");
                Ok(Outcome::Published {
                    package: package_id,
                    version,
                    commit: resolved.commit,
                    receipt,
                })
            }
            Err(rejected @ UploadError::Rejected { .. }) => {
                tracing::warn!(package = %package_id, version = %version, "skipping: {rejected}");
                Ok(Outcome::Skipped {
                    package: package_id,
                    reference,
                    reason: rejected.to_string(),
                })
            }
            Err(UploadError::Failed(source)) => Err(PipelineError::Registry {
                package: package_id,
                reference,
                source,
            }),
        }
    }
}

fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(artifact = %path.display(), "removed artifact"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(artifact = %path.display(), "failed to remove artifact: {e}"),
    }
}
